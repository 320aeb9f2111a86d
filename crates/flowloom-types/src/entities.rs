use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStatus {
    New,
    InProgress,
    Success,
    Failed,
    Archived,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Json,
    Buttons,
    Card,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemaStatus {
    #[default]
    Active,
    Deprecated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Draft,
    Review,
    Published,
    Archived,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Discovery,
    SearchExisting,
    Generate,
    SelfCheck,
    HardValidate,
    Persist,
    Publish,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Discovery => "discovery",
            RunStage::SearchExisting => "search_existing",
            RunStage::Generate => "generate",
            RunStage::SelfCheck => "self_check",
            RunStage::HardValidate => "hard_validate",
            RunStage::Persist => "persist",
            RunStage::Publish => "publish",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    #[default]
    Short,
    Detailed,
    System,
}

/// A long-lived authoring context; owns threads, pipelines, and summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(slug: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            slug: slug.into(),
            name: name.into(),
            meta: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub flow_id: String,
    pub status: ThreadStatus,
    pub result_pipeline_id: Option<String>,
    pub context_snapshot_id: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(flow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            flow_id: flow_id.into(),
            status: ThreadStatus::New,
            result_pipeline_id: None,
            context_snapshot_id: None,
            archived: false,
            archived_at: None,
            started_at: now,
            closed_at: None,
            updated_at: now,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
            || matches!(
                self.status,
                ThreadStatus::Success | ThreadStatus::Failed | ThreadStatus::Archived
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub role: MessageRole,
    pub format: MessageFormat,
    pub parent_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_result: Option<Value>,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(thread_id: impl Into<String>, role: MessageRole, content: Value) -> Self {
        Self {
            id: new_id(),
            thread_id: thread_id.into(),
            role,
            format: MessageFormat::Text,
            parent_id: None,
            tool_name: None,
            tool_result: None,
            content,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub id: String,
    pub name: String,
    /// Semver, `MAJOR.MINOR.PATCH`.
    pub version: String,
    pub status: SchemaStatus,
    pub json: Value,
    #[serde(default)]
    pub compat_with: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>, json: Value) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            version: version.into(),
            status: SchemaStatus::Active,
            json,
            compat_with: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Named pointer to the active schema definition (`stable`, `beta`, `next`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChannel {
    pub id: String,
    pub name: String,
    pub active_schema_def_id: String,
    pub updated_at: DateTime<Utc>,
}

impl SchemaChannel {
    pub fn new(name: impl Into<String>, active_schema_def_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            active_schema_def_id: active_schema_def_id.into(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub flow_id: String,
    pub version: String,
    /// Denormalized from the referenced schema definition.
    pub schema_version: String,
    pub schema_def_id: Option<String>,
    pub status: PipelineStatus,
    pub is_published: bool,
    pub content: Value,
    /// Raw SHA-256 over the canonical JSON serialization of `content`.
    pub content_hash: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRun {
    pub id: String,
    pub flow_id: String,
    pub thread_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub stage: RunStage,
    pub status: RunStatus,
    /// Snapshot of the request that started the run.
    pub source: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cost: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub id: String,
    pub run_id: String,
    pub path: String,
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Validator finding before it is attached to a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub path: String,
    pub code: String,
    pub severity: IssueSeverity,
    pub message: String,
}

impl Issue {
    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: String,
    pub flow_id: String,
    pub version: u32,
    pub content: Value,
    #[serde(default)]
    pub pinned: Map<String, Value>,
    pub last_message_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: String,
    pub thread_id: String,
    pub kind: SummaryKind,
    pub content: Value,
    pub token_budget: u32,
    pub covering_from: Option<DateTime<Utc>>,
    pub covering_to: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub flow_id: String,
    pub origin_thread_id: Option<String>,
    pub schema_def_id: String,
    pub flow_summary_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn generate_id() -> String {
    new_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_status_round_trips_as_screaming_snake() {
        let s = serde_json::to_string(&ThreadStatus::InProgress).unwrap();
        assert_eq!(s, "\"IN_PROGRESS\"");
        let back: ThreadStatus = serde_json::from_str(&s).unwrap();
        assert_eq!(back, ThreadStatus::InProgress);
    }

    #[test]
    fn run_stage_names_match_wire_format() {
        assert_eq!(RunStage::SelfCheck.as_str(), "self_check");
        assert_eq!(
            serde_json::to_value(RunStage::HardValidate).unwrap(),
            json!("hard_validate")
        );
    }

    #[test]
    fn closed_thread_detection() {
        let mut t = Thread::new("f1");
        assert!(!t.is_closed());
        t.status = ThreadStatus::Success;
        assert!(t.is_closed());
    }
}
