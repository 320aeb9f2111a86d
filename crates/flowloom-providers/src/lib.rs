use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{warn, Level};

use flowloom_observability::{emit_event, ObservabilityEvent, ProcessKind};

const SYS_GENERATE: &str = "You are a pipeline authoring assistant. Using the provided schema, \
flow summary, and currently published pipeline, produce a pipeline document for the user's \
request. Return ONLY a JSON object conforming to the schema.";

const SYS_SELF_CHECK: &str = "You review draft pipeline documents for consistency problems. \
Output JSON with keys: notes (array of strings), risks (array of strings). Return ONLY JSON.";

const SYS_SUMMARIZE: &str = "You are a helpful assistant that writes concise summaries. Output \
JSON with keys: summary (string), bullets (array of strings). Be brief but cover key facts.";

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Transport-level chat backend. The port below layers retries, timeouts,
/// and response parsing on top of this.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;
    async fn chat(&self, messages: &[ChatMessage]) -> anyhow::Result<String>;
}

/// The narrow contract the run engine and summarizer consume. Implementations
/// never fail outward: terminal provider errors degrade to safe static
/// fallbacks so callers keep making progress.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn generate_pipeline(&self, context: &Value, user_message: &Value) -> Value;
    async fn self_check(&self, draft: &Value) -> Value;
    async fn summarize(&self, thread_payload: &Value) -> Value;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub provider: String,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_base: Duration,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            timeout: Duration::from_secs(30),
            retries: 3,
            backoff_base: Duration::from_millis(500),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
        }
    }
}

/// Builds the configured port: `mock` for deterministic local runs, anything
/// else goes through the OpenAI-compatible backend.
pub fn build_llm(settings: &LlmSettings) -> Arc<dyn LlmPort> {
    if settings.provider == "mock" {
        return Arc::new(MockLlm);
    }
    let backend = OpenAiBackend::new(
        settings.api_key.clone(),
        settings.base_url.clone(),
        settings.model.clone(),
        settings.timeout,
    );
    Arc::new(LlmClient::new(
        Arc::new(backend),
        settings.retries,
        settings.backoff_base,
    ))
}

// ---- safe fallbacks ----

pub fn fallback_pipeline() -> Value {
    json!({
        "name": "example-pipeline",
        "stages": [
            {"name": "load", "type": "source", "params": {"path": "s3://bucket/key"}},
            {"name": "transform", "type": "map", "params": {"fn": "clean_text"}},
            {"name": "save", "type": "sink", "params": {"table": "results"}}
        ]
    })
}

pub fn fallback_self_check() -> Value {
    json!({
        "notes": [
            "Verify `path` exists.",
            "Validate that `table` is present and accessible."
        ],
        "risks": []
    })
}

pub fn fallback_summary() -> Value {
    json!({"summary": "", "bullets": []})
}

/// Providers wrap JSON in prose or code fences often enough that the parser
/// has to tolerate it.
pub fn parse_json_object(text: &str) -> Option<Value> {
    let trimmed = strip_code_fences(text.trim());
    let value: Value = serde_json::from_str(trimmed).ok()?;
    value.is_object().then_some(value)
}

fn strip_code_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop an optional language tag on the fence line
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(text)
}

// ---- OpenAI-compatible backend ----

pub struct OpenAiBackend {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            model,
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn id(&self) -> &str {
        "openai"
    }

    async fn chat(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
            "temperature": 0.2,
        });
        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?.error_for_status()?;
        let body: Value = response.json().await?;
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("chat completion response had no content"))?;
        Ok(content.to_string())
    }
}

// ---- retrying port over a chat backend ----

pub struct LlmClient {
    backend: Arc<dyn ChatBackend>,
    retries: u32,
    backoff_base: Duration,
}

impl LlmClient {
    pub fn new(backend: Arc<dyn ChatBackend>, retries: u32, backoff_base: Duration) -> Self {
        Self {
            backend,
            retries,
            backoff_base,
        }
    }

    /// Runs the chat with retries and exponential backoff plus jitter.
    /// Returns None after the final attempt fails or never parses.
    async fn call(&self, method: &str, messages: &[ChatMessage]) -> Option<Value> {
        let attempts = self.retries.max(1);
        for attempt in 0..attempts {
            let started = Instant::now();
            let outcome = self.backend.chat(messages).await;
            let latency = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(text) => {
                    if let Some(value) = parse_json_object(&text) {
                        emit_event(
                            Level::INFO,
                            ProcessKind::Api,
                            ObservabilityEvent {
                                event: "llm.call",
                                component: "providers",
                                provider_id: Some(self.backend.id()),
                                method: Some(method),
                                status: Some("ok"),
                                latency_ms: Some(latency),
                                ..Default::default()
                            },
                        );
                        return Some(value);
                    }
                    emit_event(
                        Level::WARN,
                        ProcessKind::Api,
                        ObservabilityEvent {
                            event: "llm.call",
                            component: "providers",
                            provider_id: Some(self.backend.id()),
                            method: Some(method),
                            status: Some("unparsable"),
                            latency_ms: Some(latency),
                            ..Default::default()
                        },
                    );
                }
                Err(err) => {
                    emit_event(
                        Level::WARN,
                        ProcessKind::Api,
                        ObservabilityEvent {
                            event: "llm.call",
                            component: "providers",
                            provider_id: Some(self.backend.id()),
                            method: Some(method),
                            status: Some("error"),
                            latency_ms: Some(latency),
                            detail: Some(&err.to_string()),
                            ..Default::default()
                        },
                    );
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }
        warn!(
            method,
            provider = self.backend.id(),
            "llm call exhausted retries, using fallback"
        );
        None
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.backoff_base.as_millis() as u64;
        let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let jitter = rand::thread_rng().gen_range(0..=base_ms.max(1) / 2);
        Duration::from_millis(exp + jitter)
    }
}

#[async_trait]
impl LlmPort for LlmClient {
    async fn generate_pipeline(&self, context: &Value, user_message: &Value) -> Value {
        let messages = [
            ChatMessage::system(SYS_GENERATE),
            ChatMessage::user(
                json!({"context": context, "user_message": user_message}).to_string(),
            ),
        ];
        self.call("generate_pipeline", &messages)
            .await
            .unwrap_or_else(fallback_pipeline)
    }

    async fn self_check(&self, draft: &Value) -> Value {
        let messages = [
            ChatMessage::system(SYS_SELF_CHECK),
            ChatMessage::user(draft.to_string()),
        ];
        self.call("self_check", &messages)
            .await
            .unwrap_or_else(fallback_self_check)
    }

    async fn summarize(&self, thread_payload: &Value) -> Value {
        let messages = [
            ChatMessage::system(SYS_SUMMARIZE),
            ChatMessage::user(thread_payload.to_string()),
        ];
        self.call("summarize", &messages)
            .await
            .unwrap_or_else(fallback_summary)
    }
}

/// Deterministic port for local development and tests.
pub struct MockLlm;

#[async_trait]
impl LlmPort for MockLlm {
    async fn generate_pipeline(&self, _context: &Value, _user_message: &Value) -> Value {
        fallback_pipeline()
    }

    async fn self_check(&self, _draft: &Value) -> Value {
        fallback_self_check()
    }

    async fn summarize(&self, thread_payload: &Value) -> Value {
        let count = thread_payload
            .get("messages")
            .and_then(Value::as_array)
            .map(|m| m.len())
            .unwrap_or(0);
        json!({
            "summary": format!("Conversation with {count} messages."),
            "bullets": []
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        calls: AtomicU32,
        fail_first: u32,
        reply: String,
    }

    #[async_trait]
    impl ChatBackend for FlakyBackend {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn chat(&self, _messages: &[ChatMessage]) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient");
            }
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn parser_strips_code_fences() {
        let fenced = "```json\n{\"name\": \"p\"}\n```";
        let value = parse_json_object(fenced).unwrap();
        assert_eq!(value["name"], "p");
    }

    #[test]
    fn parser_rejects_non_objects() {
        assert!(parse_json_object("[1, 2, 3]").is_none());
        assert!(parse_json_object("not json").is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 2,
            reply: "{\"name\": \"p\", \"stages\": []}".to_string(),
        });
        let client = LlmClient::new(backend.clone(), 3, Duration::from_millis(1));
        let draft = client
            .generate_pipeline(&json!({}), &json!({"text": "hi"}))
            .await;
        assert_eq!(draft["name"], "p");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_failure_returns_fallback() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            reply: String::new(),
        });
        let client = LlmClient::new(backend, 2, Duration::from_millis(1));
        let draft = client
            .generate_pipeline(&json!({}), &json!({"text": "hi"}))
            .await;
        assert_eq!(draft, fallback_pipeline());

        let check = client.self_check(&json!({"name": "p"})).await;
        assert_eq!(check, fallback_self_check());
    }

    #[tokio::test]
    async fn mock_port_is_deterministic() {
        let mock = MockLlm;
        let draft = mock.generate_pipeline(&json!({}), &json!({})).await;
        assert_eq!(draft, fallback_pipeline());
        let summary = mock
            .summarize(&json!({"messages": [{"role": "user"}]}))
            .await;
        assert_eq!(summary["summary"], "Conversation with 1 messages.");
    }
}
