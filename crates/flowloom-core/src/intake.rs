use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;

use flowloom_types::{CreateMessageRequest, Message, MessageFormat, MessageRole};

use crate::errors::{CoreError, CoreResult};
use crate::event_bus::EventBus;
use crate::store::Store;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window rate limiter keyed by thread id.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
    limit: u32,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
        }
    }

    pub async fn check(&self, key: &str) -> CoreResult<()> {
        if self.limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.to_string()).or_default();
        bucket.retain(|t| now.duration_since(*t) < RATE_WINDOW);
        if bucket.len() >= self.limit as usize {
            return Err(CoreError::RateLimited(format!(
                "Rate limit exceeded: max {} messages per minute for this thread",
                self.limit
            )));
        }
        bucket.push(now);
        Ok(())
    }
}

/// Validates and persists user-supplied messages, emitting `message.created`
/// on the thread's stream. Run triggering is layered on top by the caller.
pub struct MessageIntake {
    store: Arc<Store>,
    bus: EventBus,
    rate: RateLimiter,
    max_text_len: usize,
}

impl MessageIntake {
    pub fn new(store: Arc<Store>, bus: EventBus, rate_per_minute: u32, max_text_len: usize) -> Self {
        Self {
            store,
            bus,
            rate: RateLimiter::new(rate_per_minute),
            max_text_len,
        }
    }

    pub async fn add_user_message(
        &self,
        thread_id: &str,
        req: CreateMessageRequest,
    ) -> CoreResult<Message> {
        if req.role != MessageRole::User {
            return Err(CoreError::Validation(
                "Only role=user is supported for posting messages".to_string(),
            ));
        }
        let thread = self
            .store
            .read({
                let id = thread_id.to_string();
                move |t| t.thread(&id).cloned()
            })
            .await?;
        if thread.is_closed() || thread.archived {
            return Err(CoreError::Validation(format!(
                "Thread {thread_id} is closed"
            )));
        }

        self.rate.check(thread_id).await?;

        let format = req.format.unwrap_or_default();
        if matches!(format, MessageFormat::Text | MessageFormat::Markdown) {
            let text_len = extracted_text_len(&req.content);
            if text_len > self.max_text_len {
                return Err(CoreError::Validation(format!(
                    "Message text too long: {} > {}",
                    text_len, self.max_text_len
                )));
            }
        }

        let mut message = Message::new(thread_id, MessageRole::User, req.content);
        message.format = format;
        message.parent_id = req.parent_id;
        message.tool_name = req.tool_name;
        message.tool_result = req.tool_result;
        let stored = message.clone();
        self.store
            .transact(move |t| t.insert_message(stored))
            .await?;

        self.bus
            .publish(
                thread_id,
                "message.created",
                json!({
                    "message_id": message.id,
                    "role": message.role,
                    "format": message.format,
                    "content": message.content,
                }),
            )
            .await;
        Ok(message)
    }
}

fn extracted_text_len(content: &Value) -> usize {
    match content {
        Value::String(s) => s.chars().count(),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .map(|s| s.chars().count())
            .unwrap_or(0),
        _ => 0,
    }
}
