use std::env;
use std::time::Duration;

/// Runtime settings, resolved once at startup from the environment.
/// Every variable accepts a `FLOWLOOM_`-prefixed form that wins over the
/// unprefixed one.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub schema_channel: String,
    pub similarity_threshold: f64,
    pub sse_ping_interval: Duration,
    pub sse_buffer_maxlen: usize,
    pub sse_buffer_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub idempotency_cache_max: usize,
    pub llm_provider: String,
    pub llm_timeout: Duration,
    pub llm_retries: u32,
    pub llm_backoff_base: Duration,
    pub messages_rate_per_minute: u32,
    pub message_text_max_len: usize,
    pub auth_token: Option<String>,
    pub max_json_size: usize,
    pub log_retention_days: u64,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: Option<String>,
    pub app_version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_channel: "stable".to_string(),
            similarity_threshold: 0.75,
            sse_ping_interval: Duration::from_secs(15),
            sse_buffer_maxlen: 500,
            sse_buffer_ttl: Duration::from_secs(300),
            idempotency_ttl: Duration::from_secs(300),
            idempotency_cache_max: 1000,
            llm_provider: "mock".to_string(),
            llm_timeout: Duration::from_secs(30),
            llm_retries: 3,
            llm_backoff_base: Duration::from_millis(500),
            messages_rate_per_minute: 30,
            message_text_max_len: 4000,
            auth_token: None,
            max_json_size: 1_048_576,
            log_retention_days: 14,
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            openai_base_url: None,
            app_version: "0.1.0".to_string(),
        }
    }
}

fn lookup(name: &str) -> Option<String> {
    env::var(format!("FLOWLOOM_{name}"))
        .or_else(|_| env::var(name))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    lookup(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            schema_channel: lookup("SCHEMA_CHANNEL").unwrap_or(defaults.schema_channel),
            similarity_threshold: parsed("SIMILARITY_THRESHOLD", defaults.similarity_threshold),
            sse_ping_interval: Duration::from_secs(parsed("SSE_PING_INTERVAL", 15)),
            sse_buffer_maxlen: parsed("SSE_BUFFER_MAXLEN", defaults.sse_buffer_maxlen),
            sse_buffer_ttl: Duration::from_secs(parsed("SSE_BUFFER_TTL_SEC", 300)),
            idempotency_ttl: Duration::from_secs(parsed("IDEMPOTENCY_TTL_SEC", 300)),
            idempotency_cache_max: parsed("IDEMPOTENCY_CACHE_MAX", defaults.idempotency_cache_max),
            llm_provider: lookup("LLM_PROVIDER").unwrap_or(defaults.llm_provider),
            llm_timeout: Duration::from_secs(parsed("LLM_TIMEOUT", 30)),
            llm_retries: parsed("LLM_RETRIES", defaults.llm_retries),
            llm_backoff_base: Duration::from_millis(parsed("LLM_BACKOFF_BASE_MS", 500)),
            messages_rate_per_minute: parsed(
                "MESSAGES_RATE_PER_MINUTE",
                defaults.messages_rate_per_minute,
            ),
            message_text_max_len: parsed("MESSAGE_TEXT_MAX_LEN", defaults.message_text_max_len),
            auth_token: lookup("AUTH_TOKEN"),
            max_json_size: parsed("MAX_JSON_SIZE", defaults.max_json_size),
            log_retention_days: parsed("LOG_RETENTION_DAYS", defaults.log_retention_days),
            openai_api_key: lookup("OPENAI_API_KEY"),
            openai_model: lookup("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_base_url: lookup("OPENAI_BASE_URL"),
            app_version: lookup("APP_VERSION").unwrap_or(defaults.app_version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.schema_channel, "stable");
        assert_eq!(cfg.similarity_threshold, 0.75);
        assert_eq!(cfg.sse_buffer_maxlen, 500);
        assert_eq!(cfg.idempotency_cache_max, 1000);
        assert_eq!(cfg.messages_rate_per_minute, 30);
        assert_eq!(cfg.max_json_size, 1_048_576);
        assert_eq!(cfg.log_retention_days, 14);
    }

    #[test]
    fn prefixed_env_wins() {
        std::env::set_var("FLOWLOOM_SCHEMA_CHANNEL", "beta");
        std::env::set_var("SCHEMA_CHANNEL", "next");
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.schema_channel, "beta");
        std::env::remove_var("FLOWLOOM_SCHEMA_CHANNEL");
        std::env::remove_var("SCHEMA_CHANNEL");
    }

    #[test]
    fn unparsable_numbers_fall_back() {
        std::env::set_var("FLOWLOOM_SIMILARITY_THRESHOLD", "not-a-number");
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.similarity_threshold, 0.75);
        std::env::remove_var("FLOWLOOM_SIMILARITY_THRESHOLD");
    }
}
