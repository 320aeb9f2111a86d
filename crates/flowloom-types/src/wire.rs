use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{MessageFormat, MessageRole};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFlowRequest {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub meta: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageRequest {
    pub role: MessageRole,
    #[serde(default)]
    pub format: Option<MessageFormat>,
    pub content: Value,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_result: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub publish: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentRunRequest {
    pub user_message: Value,
    #[serde(default)]
    pub options: Option<RunOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAck {
    pub run_id: String,
    pub status: String,
}

/// Candidate pipeline surfaced by the similarity matcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suggestion {
    pub pipeline_id: String,
    pub version: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishResponse {
    pub ok: bool,
    pub flow_id: String,
    pub version: String,
    pub is_published: bool,
}

/// UI interaction reflected back onto the thread stream as `ui.ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiEventRequest {
    pub kind: String,
    #[serde(default, rename = "actionId")]
    pub action_id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSchemaDefinitionRequest {
    pub name: String,
    pub version: String,
    pub json: Value,
    #[serde(default)]
    pub compat_with: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivateChannelRequest {
    pub schema_def_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaDefinitionBrief {
    pub id: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaChannelView {
    pub name: String,
    pub active_schema_def_id: String,
    #[serde(rename = "def")]
    pub definition: Option<SchemaDefinitionBrief>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseThreadResponse {
    pub ok: bool,
    pub thread_id: String,
    pub thread_summary_id: Option<String>,
    pub flow_summary_id: Option<String>,
    pub flow_summary_version: Option<u32>,
}
