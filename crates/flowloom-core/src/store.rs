use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

use flowloom_types::{
    ContextSnapshot, Flow, FlowSummary, GenerationRun, Message, MessageRole, Pipeline,
    PipelineStatus, SchemaChannel, SchemaDefinition, Thread, ThreadStatus, ThreadSummary,
    ValidationIssue,
};

use crate::errors::{CoreError, CoreResult};

const STATE_FILE: &str = "state.json";

/// Every persistent table. A transaction mutates a clone of this struct and
/// the result replaces the live copy only after the guard layer accepts it.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Tables {
    pub flows: HashMap<String, Flow>,
    pub threads: HashMap<String, Thread>,
    pub messages: HashMap<String, Message>,
    pub schema_defs: HashMap<String, SchemaDefinition>,
    pub schema_channels: HashMap<String, SchemaChannel>,
    pub pipelines: HashMap<String, Pipeline>,
    pub runs: HashMap<String, GenerationRun>,
    pub issues: HashMap<String, ValidationIssue>,
    pub flow_summaries: HashMap<String, FlowSummary>,
    pub thread_summaries: HashMap<String, ThreadSummary>,
    pub snapshots: HashMap<String, ContextSnapshot>,
}

impl Tables {
    // ---- lookups ----

    pub fn flow(&self, id: &str) -> CoreResult<&Flow> {
        self.flows
            .get(id)
            .ok_or_else(|| CoreError::not_found(format!("Flow {id} not found")))
    }

    pub fn flow_by_slug(&self, slug: &str) -> Option<&Flow> {
        let needle = slug.to_lowercase();
        self.flows.values().find(|f| f.slug.to_lowercase() == needle)
    }

    pub fn thread(&self, id: &str) -> CoreResult<&Thread> {
        self.threads
            .get(id)
            .ok_or_else(|| CoreError::not_found(format!("Thread {id} not found")))
    }

    pub fn thread_mut(&mut self, id: &str) -> CoreResult<&mut Thread> {
        self.threads
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found(format!("Thread {id} not found")))
    }

    pub fn pipeline(&self, id: &str) -> CoreResult<&Pipeline> {
        self.pipelines
            .get(id)
            .ok_or_else(|| CoreError::not_found(format!("Pipeline {id} not found")))
    }

    pub fn run(&self, id: &str) -> CoreResult<&GenerationRun> {
        self.runs
            .get(id)
            .ok_or_else(|| CoreError::not_found(format!("Run {id} not found")))
    }

    pub fn run_mut(&mut self, id: &str) -> CoreResult<&mut GenerationRun> {
        self.runs
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found(format!("Run {id} not found")))
    }

    pub fn schema_def(&self, id: &str) -> CoreResult<&SchemaDefinition> {
        self.schema_defs
            .get(id)
            .ok_or_else(|| CoreError::SchemaDefinitionMissing(format!(
                "Schema definition {id} not found"
            )))
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&SchemaChannel> {
        self.schema_channels.values().find(|c| c.name == name)
    }

    /// Messages of a thread in total order `(created_at, id)`.
    pub fn messages_for_thread(&self, thread_id: &str) -> Vec<&Message> {
        let mut rows: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .collect();
        rows.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        rows
    }

    /// Pipelines of a flow, newest first.
    pub fn pipelines_for_flow(&self, flow_id: &str) -> Vec<&Pipeline> {
        let mut rows: Vec<&Pipeline> = self
            .pipelines
            .values()
            .filter(|p| p.flow_id == flow_id)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    pub fn latest_pipeline_for_flow(&self, flow_id: &str) -> Option<&Pipeline> {
        self.pipelines_for_flow(flow_id).into_iter().next()
    }

    pub fn pipeline_by_hash(&self, flow_id: &str, hash: &[u8]) -> Option<&Pipeline> {
        self.pipelines.values().find(|p| {
            p.flow_id == flow_id && p.content_hash.as_deref() == Some(hash)
        })
    }

    pub fn published_pipeline(&self, flow_id: &str) -> Option<&Pipeline> {
        self.pipelines
            .values()
            .find(|p| p.flow_id == flow_id && p.is_published)
    }

    pub fn active_flow_summary(&self, flow_id: &str) -> Option<&FlowSummary> {
        self.flow_summaries
            .values()
            .find(|s| s.flow_id == flow_id && s.is_active)
    }

    /// Thread summaries, newest first.
    pub fn summaries_for_thread(&self, thread_id: &str) -> Vec<&ThreadSummary> {
        let mut rows: Vec<&ThreadSummary> = self
            .thread_summaries
            .values()
            .filter(|s| s.thread_id == thread_id)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    pub fn issues_for_run(&self, run_id: &str) -> Vec<&ValidationIssue> {
        let mut rows: Vec<&ValidationIssue> = self
            .issues
            .values()
            .filter(|i| i.run_id == run_id)
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows
    }

    // ---- mutations ----

    pub fn insert_flow(&mut self, flow: Flow) -> CoreResult<()> {
        if self.flow_by_slug(&flow.slug).is_some() {
            return Err(CoreError::Duplicate(format!(
                "Flow slug '{}' already exists",
                flow.slug
            )));
        }
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    /// Deletes a flow and everything it owns.
    pub fn delete_flow(&mut self, flow_id: &str) -> CoreResult<()> {
        self.flow(flow_id)?;
        let thread_ids: HashSet<String> = self
            .threads
            .values()
            .filter(|t| t.flow_id == flow_id)
            .map(|t| t.id.clone())
            .collect();
        let run_ids: HashSet<String> = self
            .runs
            .values()
            .filter(|r| r.flow_id == flow_id)
            .map(|r| r.id.clone())
            .collect();
        self.messages.retain(|_, m| !thread_ids.contains(&m.thread_id));
        self.thread_summaries
            .retain(|_, s| !thread_ids.contains(&s.thread_id));
        self.issues.retain(|_, i| !run_ids.contains(&i.run_id));
        self.runs.retain(|_, r| r.flow_id != flow_id);
        self.pipelines.retain(|_, p| p.flow_id != flow_id);
        self.flow_summaries.retain(|_, s| s.flow_id != flow_id);
        self.snapshots.retain(|_, s| s.flow_id != flow_id);
        self.threads.retain(|_, t| t.flow_id != flow_id);
        self.flows.remove(flow_id);
        Ok(())
    }

    pub fn insert_thread(&mut self, thread: Thread) -> CoreResult<()> {
        self.flow(&thread.flow_id)?;
        self.threads.insert(thread.id.clone(), thread);
        Ok(())
    }

    pub fn insert_message(&mut self, message: Message) -> CoreResult<()> {
        self.thread(&message.thread_id)?;
        if let Some(parent_id) = &message.parent_id {
            let parent = self.messages.get(parent_id).ok_or_else(|| {
                CoreError::Validation("parent_id must belong to the same thread".to_string())
            })?;
            if parent.thread_id != message.thread_id {
                return Err(CoreError::Validation(
                    "parent_id must belong to the same thread".to_string(),
                ));
            }
        }
        if message.role == MessageRole::Tool && message.tool_name.is_none() {
            return Err(CoreError::Validation(
                "tool_name is required for role=tool".to_string(),
            ));
        }
        self.messages.insert(message.id.clone(), message);
        Ok(())
    }

    pub fn insert_schema_def(&mut self, def: SchemaDefinition) -> CoreResult<()> {
        if !is_semver(&def.version) {
            return Err(CoreError::Validation(format!(
                "Schema version '{}' is not MAJOR.MINOR.PATCH",
                def.version
            )));
        }
        let dup = self
            .schema_defs
            .values()
            .any(|d| d.name == def.name && d.version == def.version);
        if dup {
            return Err(CoreError::Duplicate(format!(
                "Schema definition ({}, {}) already exists",
                def.name, def.version
            )));
        }
        self.schema_defs.insert(def.id.clone(), def);
        Ok(())
    }

    pub fn upsert_channel(&mut self, channel: SchemaChannel) -> CoreResult<()> {
        self.schema_def(&channel.active_schema_def_id)?;
        if let Some(existing) = self
            .schema_channels
            .values_mut()
            .find(|c| c.name == channel.name)
        {
            existing.active_schema_def_id = channel.active_schema_def_id;
            existing.updated_at = Utc::now();
            return Ok(());
        }
        self.schema_channels.insert(channel.id.clone(), channel);
        Ok(())
    }

    pub fn insert_pipeline(&mut self, pipeline: Pipeline) -> CoreResult<()> {
        self.flow(&pipeline.flow_id)?;
        let version_taken = self
            .pipelines
            .values()
            .any(|p| p.flow_id == pipeline.flow_id && p.version == pipeline.version);
        if version_taken {
            return Err(CoreError::Duplicate(format!(
                "Pipeline version {} already exists for flow {}",
                pipeline.version, pipeline.flow_id
            )));
        }
        if let Some(hash) = &pipeline.content_hash {
            if self.pipeline_by_hash(&pipeline.flow_id, hash).is_some() {
                return Err(CoreError::Duplicate(format!(
                    "Pipeline content already exists for flow {}",
                    pipeline.flow_id
                )));
            }
        }
        self.pipelines.insert(pipeline.id.clone(), pipeline);
        Ok(())
    }

    pub fn insert_run(&mut self, run: GenerationRun) -> CoreResult<()> {
        self.flow(&run.flow_id)?;
        self.runs.insert(run.id.clone(), run);
        Ok(())
    }

    pub fn insert_issue(&mut self, issue: ValidationIssue) -> CoreResult<()> {
        self.run(&issue.run_id)?;
        self.issues.insert(issue.id.clone(), issue);
        Ok(())
    }

    pub fn insert_flow_summary(&mut self, summary: FlowSummary) -> CoreResult<()> {
        self.flow(&summary.flow_id)?;
        self.flow_summaries.insert(summary.id.clone(), summary);
        Ok(())
    }

    pub fn insert_thread_summary(&mut self, summary: ThreadSummary) -> CoreResult<()> {
        self.thread(&summary.thread_id)?;
        self.thread_summaries.insert(summary.id.clone(), summary);
        Ok(())
    }

    pub fn insert_snapshot(&mut self, snapshot: ContextSnapshot) -> CoreResult<()> {
        self.flow(&snapshot.flow_id)?;
        self.snapshots.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }
}

fn is_semver(version: &str) -> bool {
    let mut parts = version.split('.');
    let ok = (0..3).all(|_| {
        parts
            .next()
            .map(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    });
    ok && parts.next().is_none()
}

/// Cross-entity integrity, enforced before every commit. A violation aborts
/// the transaction; these rules are the store-side counterpart of the
/// relational constraints the entities were designed around.
fn verify_integrity(t: &Tables) -> CoreResult<()> {
    let mut slugs = HashSet::new();
    for flow in t.flows.values() {
        if !slugs.insert(flow.slug.to_lowercase()) {
            return Err(CoreError::internal(format!(
                "integrity: duplicate flow slug {}",
                flow.slug
            )));
        }
    }

    for thread in t.threads.values() {
        if !t.flows.contains_key(&thread.flow_id) {
            return Err(CoreError::internal(format!(
                "integrity: thread {} references missing flow",
                thread.id
            )));
        }
        if let Some(closed) = thread.closed_at {
            if closed < thread.started_at {
                return Err(CoreError::internal(format!(
                    "integrity: thread {} closed before it started",
                    thread.id
                )));
            }
        }
        if thread.status == ThreadStatus::Archived && !thread.archived {
            return Err(CoreError::internal(format!(
                "integrity: archived thread {} missing archived flag",
                thread.id
            )));
        }
        if let Some(pid) = &thread.result_pipeline_id {
            let p = t.pipelines.get(pid).ok_or_else(|| {
                CoreError::internal(format!("integrity: thread {} result pipeline missing", thread.id))
            })?;
            if p.flow_id != thread.flow_id {
                return Err(CoreError::internal(format!(
                    "integrity: thread {} result pipeline crosses flows",
                    thread.id
                )));
            }
        }
        if let Some(sid) = &thread.context_snapshot_id {
            let s = t.snapshots.get(sid).ok_or_else(|| {
                CoreError::internal(format!("integrity: thread {} snapshot missing", thread.id))
            })?;
            if s.flow_id != thread.flow_id {
                return Err(CoreError::internal(format!(
                    "integrity: thread {} snapshot crosses flows",
                    thread.id
                )));
            }
        }
    }

    for message in t.messages.values() {
        if !t.threads.contains_key(&message.thread_id) {
            return Err(CoreError::internal(format!(
                "integrity: message {} references missing thread",
                message.id
            )));
        }
        if let Some(parent_id) = &message.parent_id {
            match t.messages.get(parent_id) {
                Some(parent) if parent.thread_id == message.thread_id => {}
                _ => {
                    return Err(CoreError::internal(format!(
                        "integrity: message {} parent crosses threads",
                        message.id
                    )))
                }
            }
        }
    }

    let mut published_flows = HashSet::new();
    for pipeline in t.pipelines.values() {
        if pipeline.is_published != (pipeline.status == PipelineStatus::Published) {
            return Err(CoreError::internal(format!(
                "integrity: pipeline {} publish flag and status disagree",
                pipeline.id
            )));
        }
        if pipeline.is_published && !published_flows.insert(pipeline.flow_id.clone()) {
            return Err(CoreError::internal(format!(
                "integrity: flow {} has more than one published pipeline",
                pipeline.flow_id
            )));
        }
        if let Some(def_id) = &pipeline.schema_def_id {
            let def = t.schema_defs.get(def_id).ok_or_else(|| {
                CoreError::internal(format!(
                    "integrity: pipeline {} references missing schema definition",
                    pipeline.id
                ))
            })?;
            if def.version != pipeline.schema_version {
                return Err(CoreError::internal(format!(
                    "integrity: pipeline {} schema_version out of sync",
                    pipeline.id
                )));
            }
        }
    }

    for run in t.runs.values() {
        if let (Some(started), Some(finished)) = (run.started_at, run.finished_at) {
            if finished < started || started < run.created_at {
                return Err(CoreError::internal(format!(
                    "integrity: run {} timestamps out of order",
                    run.id
                )));
            }
        }
    }

    for issue in t.issues.values() {
        if !t.runs.contains_key(&issue.run_id) {
            return Err(CoreError::internal(format!(
                "integrity: issue {} references missing run",
                issue.id
            )));
        }
    }

    let mut active_summary_flows = HashSet::new();
    let mut summary_versions = HashSet::new();
    for summary in t.flow_summaries.values() {
        if summary.version < 1 {
            return Err(CoreError::internal(format!(
                "integrity: flow summary {} version below 1",
                summary.id
            )));
        }
        if summary.is_active && !active_summary_flows.insert(summary.flow_id.clone()) {
            return Err(CoreError::internal(format!(
                "integrity: flow {} has more than one active summary",
                summary.flow_id
            )));
        }
        if !summary_versions.insert((summary.flow_id.clone(), summary.version)) {
            return Err(CoreError::internal(format!(
                "integrity: flow {} repeats summary version {}",
                summary.flow_id, summary.version
            )));
        }
    }

    for summary in t.thread_summaries.values() {
        if let (Some(from), Some(to)) = (summary.covering_from, summary.covering_to) {
            if to < from {
                return Err(CoreError::internal(format!(
                    "integrity: thread summary {} covering range inverted",
                    summary.id
                )));
            }
        }
    }

    for snapshot in t.snapshots.values() {
        if let Some(tid) = &snapshot.origin_thread_id {
            match t.threads.get(tid) {
                Some(thread) if thread.flow_id == snapshot.flow_id => {}
                _ => {
                    return Err(CoreError::internal(format!(
                        "integrity: snapshot {} origin thread crosses flows",
                        snapshot.id
                    )))
                }
            }
        }
        if let Some(fsid) = &snapshot.flow_summary_id {
            match t.flow_summaries.get(fsid) {
                Some(fs) if fs.flow_id == snapshot.flow_id => {}
                _ => {
                    return Err(CoreError::internal(format!(
                        "integrity: snapshot {} flow summary crosses flows",
                        snapshot.id
                    )))
                }
            }
        }
        if let Some(pid) = &snapshot.pipeline_id {
            match t.pipelines.get(pid) {
                Some(p) if p.flow_id == snapshot.flow_id => {}
                _ => {
                    return Err(CoreError::internal(format!(
                        "integrity: snapshot {} pipeline crosses flows",
                        snapshot.id
                    )))
                }
            }
        }
    }

    Ok(())
}

/// Persistent store: tables behind an async lock, flushed to a JSON state
/// file after each committed transaction. Writers serialize on the lock;
/// readers share it.
pub struct Store {
    base: PathBuf,
    tables: RwLock<Tables>,
}

impl Store {
    pub async fn open(base: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let state_path = base.join(STATE_FILE);
        let tables = if state_path.exists() {
            let raw = fs::read_to_string(&state_path).await?;
            serde_json::from_str::<Tables>(&raw).unwrap_or_default()
        } else {
            Tables::default()
        };
        Ok(Arc::new(Self {
            base,
            tables: RwLock::new(tables),
        }))
    }

    /// Runs `f` against a working copy of the tables. On success the copy is
    /// verified by the guard layer, committed, and flushed; on any error the
    /// copy is discarded and the live tables are untouched. The flush happens
    /// under the writer lock so the state file never regresses to an older
    /// snapshot.
    pub async fn transact<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut guard = self.tables.write().await;
        let mut work = guard.clone();
        let out = f(&mut work)?;
        verify_integrity(&work)?;
        *guard = work;
        self.flush(&guard).await;
        Ok(out)
    }

    pub async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.tables.read().await;
        f(&guard)
    }

    async fn flush(&self, tables: &Tables) {
        let path = self.base.join(STATE_FILE);
        match serde_json::to_vec(tables) {
            Ok(bytes) => {
                if let Err(err) = fs::write(&path, bytes).await {
                    warn!(path = %path.display(), %err, "state flush failed");
                }
            }
            Err(err) => warn!(%err, "state serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowloom_types::{Message, MessageRole};
    use serde_json::json;

    async fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        Store::open(dir.keep()).await.unwrap()
    }

    #[tokio::test]
    async fn transact_rolls_back_on_error() {
        let store = test_store().await;
        let flow = Flow::new("demo", "Demo");
        let flow_id = flow.id.clone();
        store
            .transact(move |t| t.insert_flow(flow))
            .await
            .unwrap();

        let err = store
            .transact(|t| {
                let dup = Flow::new("demo", "Demo again");
                t.insert_flow(dup)
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE");

        let count = store.read(|t| t.flows.len()).await;
        assert_eq!(count, 1);
        let exists = store.read(move |t| t.flows.contains_key(&flow_id)).await;
        assert!(exists);
    }

    #[tokio::test]
    async fn slug_uniqueness_is_case_insensitive() {
        let store = test_store().await;
        store
            .transact(|t| t.insert_flow(Flow::new("Orders", "Orders")))
            .await
            .unwrap();
        let err = store
            .transact(|t| t.insert_flow(Flow::new("orders", "orders")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE");
    }

    #[tokio::test]
    async fn message_parent_must_share_thread() {
        let store = test_store().await;
        let (thread_a, thread_b) = store
            .transact(|t| {
                let flow = Flow::new("demo", "Demo");
                let flow_id = flow.id.clone();
                t.insert_flow(flow)?;
                let a = Thread::new(flow_id.clone());
                let b = Thread::new(flow_id);
                let ids = (a.id.clone(), b.id.clone());
                t.insert_thread(a)?;
                t.insert_thread(b)?;
                Ok(ids)
            })
            .await
            .unwrap();

        let parent_id = store
            .transact({
                let thread_a = thread_a.clone();
                move |t| {
                    let m = Message::new(thread_a, MessageRole::User, json!({"text": "hi"}));
                    let id = m.id.clone();
                    t.insert_message(m)?;
                    Ok(id)
                }
            })
            .await
            .unwrap();

        let err = store
            .transact(move |t| {
                let mut m = Message::new(thread_b, MessageRole::User, json!({"text": "reply"}));
                m.parent_id = Some(parent_id);
                t.insert_message(m)
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn delete_flow_cascades() {
        let store = test_store().await;
        let flow_id = store
            .transact(|t| {
                let flow = Flow::new("demo", "Demo");
                let flow_id = flow.id.clone();
                t.insert_flow(flow)?;
                let thread = Thread::new(flow_id.clone());
                let thread_id = thread.id.clone();
                t.insert_thread(thread)?;
                t.insert_message(Message::new(
                    thread_id,
                    MessageRole::User,
                    json!({"text": "hi"}),
                ))?;
                Ok(flow_id)
            })
            .await
            .unwrap();

        store
            .transact(move |t| t.delete_flow(&flow_id))
            .await
            .unwrap();
        let (flows, threads, messages) = store
            .read(|t| (t.flows.len(), t.threads.len(), t.messages.len()))
            .await;
        assert_eq!((flows, threads, messages), (0, 0, 0));
    }

    #[tokio::test]
    async fn schema_versions_must_be_semver() {
        let store = test_store().await;
        let err = store
            .transact(|t| {
                t.insert_schema_def(SchemaDefinition::new(
                    "pipeline",
                    "1.0",
                    json!({"type": "object"}),
                ))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        store
            .transact(|t| {
                t.insert_schema_def(SchemaDefinition::new(
                    "pipeline",
                    "1.0.0",
                    json!({"type": "object"}),
                ))
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.keep();
        {
            let store = Store::open(&path).await.unwrap();
            store
                .transact(|t| t.insert_flow(Flow::new("persisted", "Persisted")))
                .await
                .unwrap();
        }
        let store = Store::open(&path).await.unwrap();
        let found = store.read(|t| t.flow_by_slug("persisted").is_some()).await;
        assert!(found);
    }
}
