use chrono::Utc;

use flowloom_types::{generate_id, ContextSnapshot, Thread};

use crate::errors::{CoreError, CoreResult};
use crate::store::Store;

/// Creates a thread together with the context snapshot it exclusively owns.
/// The two rows reference each other, so the snapshot is inserted first with
/// no origin, the thread second, and the origin backfilled, all in one
/// transaction.
pub async fn create_thread_with_snapshot(
    store: &Store,
    flow_id: &str,
    channel: &str,
) -> CoreResult<Thread> {
    let flow_id = flow_id.to_string();
    let channel = channel.to_string();
    store
        .transact(move |t| {
            t.flow(&flow_id)?;
            let channel_row = t.channel_by_name(&channel).ok_or_else(|| {
                CoreError::SchemaChannelMissing(format!(
                    "No schema channel named '{channel}' is configured"
                ))
            })?;
            let schema_def_id = t.schema_def(&channel_row.active_schema_def_id)?.id.clone();
            let flow_summary_id = t.active_flow_summary(&flow_id).map(|s| s.id.clone());
            let pipeline_id = t.published_pipeline(&flow_id).map(|p| p.id.clone());

            let snapshot = ContextSnapshot {
                id: generate_id(),
                flow_id: flow_id.clone(),
                origin_thread_id: None,
                schema_def_id,
                flow_summary_id,
                pipeline_id,
                notes: None,
                created_at: Utc::now(),
            };
            let snapshot_id = snapshot.id.clone();
            t.insert_snapshot(snapshot)?;

            let mut thread = Thread::new(flow_id);
            thread.context_snapshot_id = Some(snapshot_id.clone());
            let created = thread.clone();
            t.insert_thread(thread)?;

            if let Some(snapshot) = t.snapshots.get_mut(&snapshot_id) {
                snapshot.origin_thread_id = Some(created.id.clone());
            }
            Ok(created)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowloom_types::{Flow, SchemaChannel, SchemaDefinition};
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded(with_channel: bool) -> (Arc<Store>, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.keep()).await.unwrap();
        let flow_id = store
            .transact(move |t| {
                let flow = Flow::new("demo", "Demo");
                let flow_id = flow.id.clone();
                t.insert_flow(flow)?;
                if with_channel {
                    let def =
                        SchemaDefinition::new("pipeline", "1.0.0", json!({"type": "object"}));
                    let def_id = def.id.clone();
                    t.insert_schema_def(def)?;
                    t.upsert_channel(SchemaChannel::new("stable", def_id))?;
                }
                Ok(flow_id)
            })
            .await
            .unwrap();
        (store, flow_id)
    }

    #[tokio::test]
    async fn thread_and_snapshot_reference_each_other() {
        let (store, flow_id) = seeded(true).await;
        let thread = create_thread_with_snapshot(&store, &flow_id, "stable")
            .await
            .unwrap();
        let snapshot_id = thread.context_snapshot_id.clone().unwrap();
        let origin = store
            .read(move |t| t.snapshots.get(&snapshot_id).unwrap().origin_thread_id.clone())
            .await;
        assert_eq!(origin.as_deref(), Some(thread.id.as_str()));
    }

    #[tokio::test]
    async fn missing_channel_blocks_thread_creation() {
        let (store, flow_id) = seeded(false).await;
        let err = create_thread_with_snapshot(&store, &flow_id, "stable")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCHEMA_CHANNEL_MISSING");
        // nothing was half-written
        let (threads, snapshots) = store.read(|t| (t.threads.len(), t.snapshots.len())).await;
        assert_eq!((threads, snapshots), (0, 0));
    }
}
