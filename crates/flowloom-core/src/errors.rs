use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// Domain error taxonomy. Each variant maps to a stable client-facing code
/// and an HTTP status; the server layer renders the uniform envelope.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Duplicate(String),
    #[error("{0}")]
    Validation(String),
    #[error("idempotency key reused with a different payload")]
    IdempotencyKeyReused,
    #[error("{0}")]
    PublishConflict(String),
    #[error("missing or invalid authorization token")]
    Unauthorized,
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    SchemaChannelMissing(String),
    #[error("{0}")]
    SchemaDefinitionMissing(String),
    #[error("{0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Duplicate(_) => "DUPLICATE",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            CoreError::PublishConflict(_) => "PIPELINE_PUBLISH_CONFLICT",
            CoreError::Unauthorized => "UNAUTHORIZED",
            CoreError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            CoreError::RateLimited(_) => "RATE_LIMITED",
            CoreError::SchemaChannelMissing(_) => "SCHEMA_CHANNEL_MISSING",
            CoreError::SchemaDefinitionMissing(_) => "SCHEMA_DEFINITION_MISSING",
            CoreError::Internal(_) => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::NotFound(_) => 404,
            CoreError::Duplicate(_) => 409,
            CoreError::Validation(_) => 422,
            CoreError::IdempotencyKeyReused => 409,
            CoreError::PublishConflict(_) => 409,
            CoreError::Unauthorized => 401,
            CoreError::PayloadTooLarge(_) => 413,
            CoreError::RateLimited(_) => 429,
            CoreError::SchemaChannelMissing(_) => 503,
            CoreError::SchemaDefinitionMissing(_) => 503,
            CoreError::Internal(_) => 500,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        CoreError::Internal(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        assert_eq!(CoreError::not_found("thread").code(), "NOT_FOUND");
        assert_eq!(CoreError::not_found("thread").http_status(), 404);
        assert_eq!(CoreError::IdempotencyKeyReused.http_status(), 409);
        assert_eq!(
            CoreError::SchemaChannelMissing("stable".into()).http_status(),
            503
        );
    }
}
