use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use flowloom_providers::LlmPort;
use flowloom_types::{
    generate_id, CloseThreadResponse, FlowSummary, SummaryKind, Thread, ThreadStatus,
    ThreadSummary,
};

use crate::errors::{CoreError, CoreResult};
use crate::store::{Store, Tables};

const DEFAULT_TOKEN_BUDGET: u32 = 1024;

/// Closes threads: produces a thread summary, rolls the flow's active
/// summary forward, and marks the thread finished, all in one transaction.
/// Closing an already-closed thread is a no-op that returns the latest
/// summary references.
pub struct Summarizer {
    store: Arc<Store>,
    llm: Arc<dyn LlmPort>,
}

impl Summarizer {
    pub fn new(store: Arc<Store>, llm: Arc<dyn LlmPort>) -> Self {
        Self { store, llm }
    }

    pub async fn close_thread(&self, thread_id: &str) -> CoreResult<CloseThreadResponse> {
        let thread = self
            .store
            .read({
                let id = thread_id.to_string();
                move |t| t.thread(&id).cloned()
            })
            .await?;
        if thread.is_closed() {
            return Ok(self
                .store
                .read({
                    let id = thread_id.to_string();
                    move |t| latest_refs(t, &id)
                })
                .await);
        }

        // The LLM call happens outside the transaction; only the writes are
        // atomic.
        let payload = self
            .store
            .read({
                let id = thread_id.to_string();
                let flow_id = thread.flow_id.clone();
                move |t| thread_payload(t, &id, &flow_id)
            })
            .await;
        let summary = self.llm.summarize(&payload).await;

        let id = thread_id.to_string();
        self.store
            .transact(move |t| {
                let thread: Thread = t.thread(&id)?.clone();
                if thread.is_closed() {
                    return Ok(latest_refs(t, &id));
                }

                let messages = t.messages_for_thread(&id);
                let covering_from = messages.first().map(|m| m.created_at);
                let covering_to = messages.last().map(|m| m.created_at);
                let last_message_id = messages.last().map(|m| m.id.clone());

                let thread_summary = ThreadSummary {
                    id: generate_id(),
                    thread_id: id.clone(),
                    kind: SummaryKind::Short,
                    content: summary.clone(),
                    token_budget: DEFAULT_TOKEN_BUDGET,
                    covering_from,
                    covering_to,
                    created_at: Utc::now(),
                };
                let thread_summary_id = thread_summary.id.clone();
                t.insert_thread_summary(thread_summary)?;

                let now = Utc::now();
                let (flow_summary_id, flow_summary_version) =
                    match t.active_flow_summary(&thread.flow_id).map(|s| s.id.clone()) {
                        Some(active_id) => {
                            let version = {
                                let active =
                                    t.flow_summaries.get_mut(&active_id).ok_or_else(|| {
                                        CoreError::internal("active flow summary disappeared")
                                    })?;
                                active.version += 1;
                                active.content = summary.clone();
                                active.last_message_id = last_message_id;
                                active.updated_at = now;
                                active.version
                            };
                            (active_id, Some(version))
                        }
                        None => {
                            let fresh = FlowSummary {
                                id: generate_id(),
                                flow_id: thread.flow_id.clone(),
                                version: 1,
                                content: summary.clone(),
                                pinned: Default::default(),
                                last_message_id,
                                is_active: true,
                                created_at: now,
                                updated_at: now,
                            };
                            let fresh_id = fresh.id.clone();
                            t.insert_flow_summary(fresh)?;
                            (fresh_id, Some(1))
                        }
                    };

                // only one active summary per flow
                for other in t
                    .flow_summaries
                    .values_mut()
                    .filter(|s| s.flow_id == thread.flow_id && s.id != flow_summary_id)
                {
                    other.is_active = false;
                }

                let row = t.thread_mut(&id)?;
                row.status = ThreadStatus::Success;
                row.closed_at = Some(now);
                row.updated_at = now;

                Ok(CloseThreadResponse {
                    ok: true,
                    thread_id: id.clone(),
                    thread_summary_id: Some(thread_summary_id),
                    flow_summary_id: Some(flow_summary_id),
                    flow_summary_version,
                })
            })
            .await
    }
}

fn latest_refs(t: &Tables, thread_id: &str) -> CloseThreadResponse {
    let thread_summary_id = t
        .summaries_for_thread(thread_id)
        .first()
        .map(|s| s.id.clone());
    let (flow_summary_id, flow_summary_version) = t
        .threads
        .get(thread_id)
        .and_then(|thread| t.active_flow_summary(&thread.flow_id))
        .map(|s| (Some(s.id.clone()), Some(s.version)))
        .unwrap_or((None, None));
    CloseThreadResponse {
        ok: true,
        thread_id: thread_id.to_string(),
        thread_summary_id,
        flow_summary_id,
        flow_summary_version,
    }
}

fn thread_payload(t: &Tables, thread_id: &str, flow_id: &str) -> Value {
    let messages: Vec<Value> = t
        .messages_for_thread(thread_id)
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "role": m.role,
                "format": m.format,
                "content": m.content,
                "created_at": m.created_at.to_rfc3339(),
            })
        })
        .collect();
    json!({
        "thread_id": thread_id,
        "flow_id": flow_id,
        "messages": messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowloom_providers::MockLlm;
    use flowloom_types::{Flow, Message, MessageRole};

    async fn seeded() -> (Arc<Store>, String, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.keep()).await.unwrap();
        let (flow_id, thread_id) = store
            .transact(|t| {
                let flow = Flow::new("demo", "Demo");
                let flow_id = flow.id.clone();
                t.insert_flow(flow)?;
                let thread = Thread::new(flow_id.clone());
                let thread_id = thread.id.clone();
                t.insert_thread(thread)?;
                t.insert_message(Message::new(
                    thread_id.clone(),
                    MessageRole::User,
                    json!({"text": "hello"}),
                ))?;
                t.insert_message(Message::new(
                    thread_id.clone(),
                    MessageRole::Assistant,
                    json!({"text": "hi"}),
                ))?;
                Ok((flow_id, thread_id))
            })
            .await
            .unwrap();
        (store, flow_id, thread_id)
    }

    #[tokio::test]
    async fn close_creates_summaries_and_finishes_the_thread() {
        let (store, flow_id, thread_id) = seeded().await;
        let summarizer = Summarizer::new(store.clone(), Arc::new(MockLlm));

        let out = summarizer.close_thread(&thread_id).await.unwrap();
        assert!(out.ok);
        assert!(out.thread_summary_id.is_some());
        assert_eq!(out.flow_summary_version, Some(1));

        let (status, closed_at, covering_ok, active_count) = store
            .read({
                let thread_id = thread_id.clone();
                let flow_id = flow_id.clone();
                move |t| {
                    let thread = t.threads.get(&thread_id).unwrap();
                    let summary = t.summaries_for_thread(&thread_id)[0];
                    let covering_ok = match (summary.covering_from, summary.covering_to) {
                        (Some(from), Some(to)) => from <= to,
                        _ => false,
                    };
                    let active = t
                        .flow_summaries
                        .values()
                        .filter(|s| s.flow_id == flow_id && s.is_active)
                        .count();
                    (thread.status, thread.closed_at, covering_ok, active)
                }
            })
            .await;
        assert_eq!(status, ThreadStatus::Success);
        assert!(closed_at.is_some());
        assert!(covering_ok);
        assert_eq!(active_count, 1);
    }

    #[tokio::test]
    async fn second_close_is_a_no_op_with_the_same_refs() {
        let (store, _flow_id, thread_id) = seeded().await;
        let summarizer = Summarizer::new(store.clone(), Arc::new(MockLlm));

        let first = summarizer.close_thread(&thread_id).await.unwrap();
        let rows_after_first = store
            .read(|t| (t.thread_summaries.len(), t.flow_summaries.len()))
            .await;

        let second = summarizer.close_thread(&thread_id).await.unwrap();
        let rows_after_second = store
            .read(|t| (t.thread_summaries.len(), t.flow_summaries.len()))
            .await;

        assert_eq!(first.thread_summary_id, second.thread_summary_id);
        assert_eq!(first.flow_summary_id, second.flow_summary_id);
        assert_eq!(first.flow_summary_version, second.flow_summary_version);
        assert_eq!(rows_after_first, rows_after_second);
    }

    #[tokio::test]
    async fn closing_a_second_thread_bumps_the_flow_summary_version() {
        let (store, flow_id, thread_id) = seeded().await;
        let summarizer = Summarizer::new(store.clone(), Arc::new(MockLlm));
        summarizer.close_thread(&thread_id).await.unwrap();

        let other_thread = store
            .transact({
                let flow_id = flow_id.clone();
                move |t| {
                    let thread = Thread::new(flow_id);
                    let id = thread.id.clone();
                    t.insert_thread(thread)?;
                    Ok(id)
                }
            })
            .await
            .unwrap();
        let out = summarizer.close_thread(&other_thread).await.unwrap();
        assert_eq!(out.flow_summary_version, Some(2));

        let versions: Vec<u32> = store
            .read(move |t| {
                t.flow_summaries
                    .values()
                    .filter(|s| s.flow_id == flow_id && s.is_active)
                    .map(|s| s.version)
                    .collect()
            })
            .await;
        assert_eq!(versions, vec![2]);
    }

    #[tokio::test]
    async fn missing_thread_is_not_found() {
        let (store, _, _) = seeded().await;
        let summarizer = Summarizer::new(store, Arc::new(MockLlm));
        let err = summarizer.close_thread("nope").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
