use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use flowloom_observability::{emit_event, observe_latency, ObservabilityEvent, ProcessKind};
use flowloom_providers::LlmPort;
use flowloom_types::{
    generate_id, GenerationRun, Issue, Message, MessageFormat, MessageRole, RunOptions, RunStage,
    RunStatus, Suggestion, ThreadStatus, ValidationIssue,
};

use crate::errors::{CoreError, CoreResult};
use crate::event_bus::EventBus;
use crate::similarity::SimilarityMatcher;
use crate::store::{Store, Tables};
use crate::validator::Validator;
use crate::versioning::VersionManager;

/// Cancellation tokens keyed by run id. Canceling marks the token; the
/// engine checks it between stages and the store-side tick ignores writes
/// for runs already marked canceled.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(id.to_string(), token.clone());
        token
    }

    pub async fn cancel(&self, id: &str) -> bool {
        match self.tokens.read().await.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &str) {
        self.tokens.write().await.remove(id);
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub flow_id: String,
    pub thread_id: String,
    pub user_message: Value,
    pub options: RunOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Init,
    SearchExisting,
    Generate,
    SelfCheck,
    HardValidate,
    Persist,
    Publish,
    Finish,
}

impl Step {
    // finish has no stage of its own; it finalizes whatever the run ended on
    fn stage(self) -> Option<RunStage> {
        match self {
            Step::Init => Some(RunStage::Discovery),
            Step::SearchExisting => Some(RunStage::SearchExisting),
            Step::Generate => Some(RunStage::Generate),
            Step::SelfCheck => Some(RunStage::SelfCheck),
            Step::HardValidate => Some(RunStage::HardValidate),
            Step::Persist => Some(RunStage::Persist),
            Step::Publish => Some(RunStage::Publish),
            Step::Finish => None,
        }
    }
}

#[derive(Default)]
struct RunState {
    candidate: Option<Suggestion>,
    draft: Option<Value>,
    issues: Vec<Issue>,
    persisted: Option<(String, String)>,
}

/// Staged agent run: discovery → search → generation → self-check → hard
/// validation → persistence → optional publication. Each stage publishes
/// lifecycle events and updates the persisted run row, which is the source
/// of truth; in-memory state is ephemeral.
#[derive(Clone)]
pub struct RunEngine {
    store: Arc<Store>,
    bus: EventBus,
    llm: Arc<dyn LlmPort>,
    matcher: SimilarityMatcher,
    validator: Validator,
    versions: VersionManager,
    cancellations: CancellationRegistry,
}

impl RunEngine {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        llm: Arc<dyn LlmPort>,
        matcher: SimilarityMatcher,
        validator: Validator,
        versions: VersionManager,
    ) -> Self {
        Self {
            store,
            bus,
            llm,
            matcher,
            validator,
            versions,
            cancellations: CancellationRegistry::new(),
        }
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Fire-and-forget execution; failures are recorded on the run row and
    /// surfaced as `run.finished` events, never to the caller.
    pub fn spawn(&self, req: RunRequest) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(req).await;
        });
    }

    pub async fn run(&self, req: RunRequest) -> String {
        let run_id = req.run_id.clone();
        let cancel = self.cancellations.create(&run_id).await;
        let started = Instant::now();
        let mut state = RunState::default();
        let mut step = Step::Init;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.exec_step(step, &req, &mut state).await {
                Ok(Some(next)) => step = next,
                Ok(None) => break,
                Err(err) => {
                    self.fail_run(&req, step, &err).await;
                    break;
                }
            }
        }
        self.cancellations.remove(&run_id).await;
        observe_latency(
            "run.duration",
            "run_engine",
            started.elapsed().as_millis() as u64,
        );
        run_id
    }

    /// Marks a run canceled; in-flight stages for it become no-ops.
    pub async fn cancel_run(&self, run_id: &str) -> CoreResult<bool> {
        let canceled = self.cancellations.cancel(run_id).await;
        let id = run_id.to_string();
        self.store
            .transact(move |t| {
                let run = t.run_mut(&id)?;
                if !run.status.is_terminal() {
                    run.status = RunStatus::Canceled;
                    run.finished_at = Some(Utc::now());
                }
                Ok(())
            })
            .await?;
        Ok(canceled)
    }

    /// Records the suggestion-only short-circuit used when a candidate is
    /// found before the staged run is worth starting: the run row captures
    /// discovery + search and finishes succeeded, with the matching event
    /// sequence on the thread stream.
    pub async fn record_suggestion_run(
        &self,
        req: &RunRequest,
        suggestion: &Suggestion,
    ) -> CoreResult<()> {
        self.bus
            .publish(
                &req.thread_id,
                "run.started",
                json!({"run_id": req.run_id, "stage": RunStage::Discovery.as_str()}),
            )
            .await;
        self.publish_stage(req, RunStage::SearchExisting, "running", None)
            .await;
        self.publish_stage(req, RunStage::SearchExisting, "succeeded", None)
            .await;
        self.bus
            .publish(
                &req.thread_id,
                "suggestion",
                serde_json::to_value(suggestion)
                    .map_err(|e| CoreError::internal(e.to_string()))?,
            )
            .await;

        let run = self.new_run_row(req);
        let run_id = req.run_id.clone();
        let result = json!({"suggestion": suggestion});
        self.store
            .transact(move |t| {
                t.insert_run(run)?;
                apply_tick(t, &run_id, RunStage::Discovery, RunStatus::Succeeded, None, None)?;
                apply_tick(
                    t,
                    &run_id,
                    RunStage::SearchExisting,
                    RunStatus::Succeeded,
                    Some(result),
                    None,
                )?;
                let row = t.run_mut(&run_id)?;
                row.finished_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        self.bus
            .publish(
                &req.thread_id,
                "run.finished",
                json!({"run_id": req.run_id, "status": RunStatus::Succeeded.as_str()}),
            )
            .await;
        emit_event(
            Level::INFO,
            ProcessKind::Api,
            ObservabilityEvent {
                event: "run.suggestion_short_circuit",
                component: "run_engine",
                run_id: Some(&req.run_id),
                thread_id: Some(&req.thread_id),
                flow_id: Some(&req.flow_id),
                status: Some("succeeded"),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn new_run_row(&self, req: &RunRequest) -> GenerationRun {
        let now = Utc::now();
        GenerationRun {
            id: req.run_id.clone(),
            flow_id: req.flow_id.clone(),
            thread_id: Some(req.thread_id.clone()),
            pipeline_id: None,
            stage: RunStage::Discovery,
            status: RunStatus::Running,
            source: req.user_message.clone(),
            result: None,
            error: None,
            cost: None,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
        }
    }

    async fn exec_step(
        &self,
        step: Step,
        req: &RunRequest,
        state: &mut RunState,
    ) -> CoreResult<Option<Step>> {
        match step {
            Step::Init => {
                self.bus
                    .publish(
                        &req.thread_id,
                        "run.started",
                        json!({"run_id": req.run_id, "stage": RunStage::Discovery.as_str()}),
                    )
                    .await;
                let run = self.new_run_row(req);
                let thread_id = req.thread_id.clone();
                self.store
                    .transact(move |t| {
                        t.insert_run(run)?;
                        let thread = t.thread_mut(&thread_id)?;
                        if thread.status == ThreadStatus::New {
                            thread.status = ThreadStatus::InProgress;
                            thread.updated_at = Utc::now();
                        }
                        Ok(())
                    })
                    .await?;
                self.tick(&req.run_id, RunStage::Discovery, RunStatus::Succeeded, None, None)
                    .await?;
                Ok(Some(Step::SearchExisting))
            }
            Step::SearchExisting => {
                self.publish_stage(req, RunStage::SearchExisting, "running", None)
                    .await;
                let candidate = self
                    .store
                    .read(|t| self.matcher.find_candidate(t, &req.flow_id, &req.user_message))
                    .await;
                state.candidate = candidate;
                let result = state
                    .candidate
                    .as_ref()
                    .map(|c| json!({"suggestion": c}));
                self.tick(
                    &req.run_id,
                    RunStage::SearchExisting,
                    RunStatus::Succeeded,
                    result,
                    None,
                )
                .await?;
                self.publish_stage(req, RunStage::SearchExisting, "succeeded", None)
                    .await;
                if let Some(candidate) = &state.candidate {
                    self.bus
                        .publish(
                            &req.thread_id,
                            "suggestion",
                            serde_json::to_value(candidate)
                                .map_err(|e| CoreError::internal(e.to_string()))?,
                        )
                        .await;
                    return Ok(Some(Step::Finish));
                }
                Ok(Some(Step::Generate))
            }
            Step::Generate => {
                self.publish_stage(req, RunStage::Generate, "running", None)
                    .await;
                let context = self
                    .store
                    .read(|t| self.gather_context(t, &req.flow_id))
                    .await;
                let draft = self.llm.generate_pipeline(&context, &req.user_message).await;
                let draft_head: Vec<String> = draft
                    .as_object()
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default();
                state.draft = Some(draft);
                self.tick(
                    &req.run_id,
                    RunStage::Generate,
                    RunStatus::Succeeded,
                    Some(json!({"draft_head": draft_head})),
                    None,
                )
                .await?;
                self.emit_assistant_message(
                    &req.thread_id,
                    MessageFormat::Markdown,
                    json!({"text": "Generating pipeline..."}),
                )
                .await?;
                self.publish_stage(req, RunStage::Generate, "succeeded", None)
                    .await;
                Ok(Some(Step::SelfCheck))
            }
            Step::SelfCheck => {
                self.publish_stage(req, RunStage::SelfCheck, "running", None)
                    .await;
                let draft = state.draft.clone().unwrap_or_else(|| json!({}));
                let notes = self.llm.self_check(&draft).await;
                self.tick(
                    &req.run_id,
                    RunStage::SelfCheck,
                    RunStatus::Succeeded,
                    Some(json!({"notes": notes})),
                    None,
                )
                .await?;
                self.emit_assistant_message(
                    &req.thread_id,
                    MessageFormat::Markdown,
                    json!({"text": "Checking consistency..."}),
                )
                .await?;
                self.emit_assistant_message(&req.thread_id, MessageFormat::Json, notes)
                    .await?;
                self.publish_stage(req, RunStage::SelfCheck, "succeeded", None)
                    .await;
                Ok(Some(Step::HardValidate))
            }
            Step::HardValidate => {
                self.publish_stage(req, RunStage::HardValidate, "running", None)
                    .await;
                let draft = state.draft.clone().unwrap_or_else(|| json!({}));
                let issues = self
                    .store
                    .read(|t| self.validator.validate(t, &draft))
                    .await?;
                state.issues = issues.clone();
                let fatal = issues.iter().any(Issue::is_error);
                let status = if fatal {
                    RunStatus::Failed
                } else {
                    RunStatus::Succeeded
                };
                let run_id = req.run_id.clone();
                let issue_rows = issues.clone();
                self.store
                    .transact(move |t| {
                        apply_tick(
                            t,
                            &run_id,
                            RunStage::HardValidate,
                            status,
                            Some(json!({"issues": issue_rows})),
                            None,
                        )?;
                        for issue in &issue_rows {
                            t.insert_issue(ValidationIssue {
                                id: generate_id(),
                                run_id: run_id.clone(),
                                path: issue.path.clone(),
                                code: issue.code.clone(),
                                severity: issue.severity,
                                message: issue.message.clone(),
                                created_at: Utc::now(),
                            })?;
                        }
                        Ok(())
                    })
                    .await?;
                if !state.issues.is_empty() {
                    self.bus
                        .publish(
                            &req.thread_id,
                            "issues",
                            json!({"items": state.issues}),
                        )
                        .await;
                }
                let status_text = if fatal { "failed" } else { "succeeded" };
                self.publish_stage(req, RunStage::HardValidate, status_text, None)
                    .await;
                Ok(Some(if fatal { Step::Finish } else { Step::Persist }))
            }
            Step::Persist => {
                self.publish_stage(req, RunStage::Persist, "running", None)
                    .await;
                let draft = state.draft.clone().unwrap_or_else(|| json!({}));
                let versions = self.versions.clone();
                let flow_id = req.flow_id.clone();
                let run_id = req.run_id.clone();
                let thread_id = req.thread_id.clone();
                let (pipeline_id, version, status) = self
                    .store
                    .transact(move |t| {
                        let pipeline = versions.create_version(t, &flow_id, &draft, true)?;
                        let run = t.run_mut(&run_id)?;
                        if run.status != RunStatus::Canceled {
                            run.pipeline_id = Some(pipeline.id.clone());
                        }
                        let thread = t.thread_mut(&thread_id)?;
                        thread.result_pipeline_id = Some(pipeline.id.clone());
                        thread.updated_at = Utc::now();
                        Ok((pipeline.id, pipeline.version, pipeline.status))
                    })
                    .await?;
                state.persisted = Some((pipeline_id.clone(), version.clone()));
                self.tick(&req.run_id, RunStage::Persist, RunStatus::Succeeded, None, None)
                    .await?;
                self.bus
                    .publish(
                        &req.thread_id,
                        "pipeline.created",
                        json!({
                            "pipeline_id": pipeline_id,
                            "version": version,
                            "status": status,
                        }),
                    )
                    .await;
                self.publish_stage(req, RunStage::Persist, "succeeded", None)
                    .await;
                Ok(Some(if req.options.publish {
                    Step::Publish
                } else {
                    Step::Finish
                }))
            }
            Step::Publish => {
                self.publish_stage(req, RunStage::Publish, "running", None)
                    .await;
                let (pipeline_id, version) = state
                    .persisted
                    .clone()
                    .ok_or_else(|| CoreError::internal("publish reached without a draft"))?;
                self.versions.publish(&self.store, &pipeline_id).await?;
                self.tick(&req.run_id, RunStage::Publish, RunStatus::Succeeded, None, None)
                    .await?;
                self.bus
                    .publish(
                        &req.thread_id,
                        "pipeline.published",
                        json!({"pipeline_id": pipeline_id, "version": version}),
                    )
                    .await;
                self.publish_stage(req, RunStage::Publish, "succeeded", None)
                    .await;
                Ok(Some(Step::Finish))
            }
            Step::Finish => {
                let failed = state.issues.iter().any(Issue::is_error);
                let status = if failed {
                    RunStatus::Failed
                } else {
                    RunStatus::Succeeded
                };
                let run_id = req.run_id.clone();
                self.store
                    .transact(move |t| {
                        let run = t.run_mut(&run_id)?;
                        if run.status != RunStatus::Canceled {
                            run.status = status;
                            run.finished_at = Some(Utc::now());
                        }
                        Ok(())
                    })
                    .await?;
                self.bus
                    .publish(
                        &req.thread_id,
                        "run.finished",
                        json!({"run_id": req.run_id, "status": status.as_str()}),
                    )
                    .await;
                Ok(None)
            }
        }
    }

    /// Stage-failure path: record the failed stage, mark the run failed in a
    /// fresh transaction, and emit the terminal event.
    async fn fail_run(&self, req: &RunRequest, step: Step, err: &CoreError) {
        let message = err.to_string();
        if let Some(stage) = step.stage() {
            let _ = self
                .tick(
                    &req.run_id,
                    stage,
                    RunStatus::Failed,
                    None,
                    Some(message.clone()),
                )
                .await;
            self.publish_stage(req, stage, "failed", Some(&message)).await;
        }

        let run_id = req.run_id.clone();
        let _ = self
            .store
            .transact(move |t| {
                let run = t.run_mut(&run_id)?;
                if run.status != RunStatus::Canceled {
                    run.status = RunStatus::Failed;
                    run.finished_at = Some(Utc::now());
                }
                Ok(())
            })
            .await;
        self.bus
            .publish(
                &req.thread_id,
                "run.finished",
                json!({"run_id": req.run_id, "status": "failed", "error": message}),
            )
            .await;
        emit_event(
            Level::ERROR,
            ProcessKind::Api,
            ObservabilityEvent {
                event: "run.failed",
                component: "run_engine",
                run_id: Some(&req.run_id),
                thread_id: Some(&req.thread_id),
                flow_id: Some(&req.flow_id),
                status: Some("failed"),
                error_code: Some(err.code()),
                detail: Some(&message),
                ..Default::default()
            },
        );
    }

    fn gather_context(&self, t: &Tables, flow_id: &str) -> Value {
        let schema_def = self
            .validator
            .active_schema(t)
            .map(|d| d.json.clone())
            .unwrap_or_else(|_| json!({}));
        let flow_summary = t.active_flow_summary(flow_id).map(|s| s.content.clone());
        let active_pipeline = t.published_pipeline(flow_id).map(|p| p.content.clone());
        json!({
            "schema_def": schema_def,
            "flow_summary": flow_summary,
            "active_pipeline": active_pipeline,
        })
    }

    async fn tick(
        &self,
        run_id: &str,
        stage: RunStage,
        status: RunStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> CoreResult<()> {
        let run_id = run_id.to_string();
        self.store
            .transact(move |t| apply_tick(t, &run_id, stage, status, result, error))
            .await
    }

    async fn publish_stage(
        &self,
        req: &RunRequest,
        stage: RunStage,
        status: &str,
        error: Option<&str>,
    ) {
        let mut data = json!({
            "run_id": req.run_id,
            "stage": stage.as_str(),
            "status": status,
        });
        if let Some(error) = error {
            data["error"] = json!(error);
        }
        self.bus.publish(&req.thread_id, "run.stage", data).await;
    }

    async fn emit_assistant_message(
        &self,
        thread_id: &str,
        format: MessageFormat,
        content: Value,
    ) -> CoreResult<()> {
        let mut message = Message::new(thread_id, MessageRole::Assistant, content.clone());
        message.format = format;
        let message_id = message.id.clone();
        self.store.transact(move |t| t.insert_message(message)).await?;
        self.bus
            .publish(
                thread_id,
                "message.created",
                json!({
                    "message_id": message_id,
                    "role": MessageRole::Assistant,
                    "format": format,
                    "content": content,
                }),
            )
            .await;
        Ok(())
    }
}

/// Updates the run row for a stage transition. Moving straight to a terminal
/// status from a different stage is done as two writes (stage with
/// status=running, then the terminal status) so the stage/status pairing
/// stays consistent at every point. Runs already canceled ignore writes.
fn apply_tick(
    t: &mut Tables,
    run_id: &str,
    stage: RunStage,
    status: RunStatus,
    result: Option<Value>,
    error: Option<String>,
) -> CoreResult<()> {
    let run = t.run_mut(run_id)?;
    if run.status == RunStatus::Canceled {
        return Ok(());
    }
    if status.is_terminal() && run.stage != stage {
        run.stage = stage;
        run.status = RunStatus::Running;
    }
    run.stage = stage;
    run.status = status;
    if let Some(result) = result {
        run.result = Some(result);
    }
    if let Some(error) = error {
        run.error = Some(error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowloom_providers::MockLlm;
    use flowloom_types::{BusEvent, Flow, SchemaChannel, SchemaDefinition, Thread};
    use serde_json::json;
    use tokio::sync::broadcast;

    struct StubLlm {
        draft: Value,
    }

    #[async_trait]
    impl LlmPort for StubLlm {
        async fn generate_pipeline(&self, _context: &Value, _user_message: &Value) -> Value {
            self.draft.clone()
        }

        async fn self_check(&self, _draft: &Value) -> Value {
            json!({"notes": [], "risks": []})
        }

        async fn summarize(&self, _thread_payload: &Value) -> Value {
            json!({"summary": "", "bullets": []})
        }
    }

    fn pipeline_schema() -> Value {
        json!({
            "type": "object",
            "required": ["name", "stages"],
            "properties": {
                "name": {"type": "string"},
                "stages": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name"],
                        "properties": {"name": {"type": "string"}}
                    }
                }
            }
        })
    }

    async fn seeded(
        llm: Arc<dyn LlmPort>,
    ) -> (RunEngine, Arc<Store>, EventBus, String, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.keep()).await.unwrap();
        let (flow_id, thread_id) = store
            .transact(|t| {
                let flow = Flow::new("demo", "Demo");
                let flow_id = flow.id.clone();
                t.insert_flow(flow)?;
                let def = SchemaDefinition::new("pipeline", "1.0.0", pipeline_schema());
                let def_id = def.id.clone();
                t.insert_schema_def(def)?;
                t.upsert_channel(SchemaChannel::new("stable", def_id))?;
                let thread = Thread::new(flow_id.clone());
                let thread_id = thread.id.clone();
                t.insert_thread(thread)?;
                Ok((flow_id, thread_id))
            })
            .await
            .unwrap();
        let bus = EventBus::with_defaults();
        let engine = RunEngine::new(
            store.clone(),
            bus.clone(),
            llm,
            SimilarityMatcher::new(0.75),
            Validator::new("stable"),
            VersionManager::new("stable"),
        );
        (engine, store, bus, flow_id, thread_id)
    }

    fn drain(rx: &mut broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn successful_run_persists_a_draft() {
        let llm = Arc::new(StubLlm {
            draft: json!({"name": "p", "stages": [{"name": "load"}]}),
        });
        let (engine, store, bus, flow_id, thread_id) = seeded(llm).await;
        let (mut rx, _) = bus.subscribe(&thread_id).await;

        let req = RunRequest {
            run_id: generate_id(),
            flow_id: flow_id.clone(),
            thread_id: thread_id.clone(),
            user_message: json!({"text": "make a pipeline"}),
            options: RunOptions::default(),
        };
        engine.run(req.clone()).await;

        let run = store
            .read({
                let id = req.run_id.clone();
                move |t| t.runs.get(&id).cloned()
            })
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.finished_at.is_some());
        assert!(run.pipeline_id.is_some());

        let pipelines = store
            .read(move |t| t.pipelines_for_flow(&flow_id).len())
            .await;
        assert_eq!(pipelines, 1);

        let types: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("run.started"));
        assert!(types.contains(&"pipeline.created".to_string()));
        assert_eq!(types.last().map(String::as_str), Some("run.finished"));
    }

    #[tokio::test]
    async fn candidate_hit_short_circuits_before_generate() {
        let content = json!({"name": "p", "stages": [{"name": "load"}]});
        let llm = Arc::new(StubLlm {
            draft: json!({"should": "never be used"}),
        });
        let (engine, store, bus, flow_id, thread_id) = seeded(llm).await;

        let vm = VersionManager::new("stable");
        let existing = store
            .transact({
                let flow_id = flow_id.clone();
                let content = content.clone();
                move |t| vm.create_version(t, &flow_id, &content, true)
            })
            .await
            .unwrap();

        let (mut rx, _) = bus.subscribe(&thread_id).await;
        let req = RunRequest {
            run_id: generate_id(),
            flow_id: flow_id.clone(),
            thread_id: thread_id.clone(),
            user_message: json!({"content": content}),
            options: RunOptions::default(),
        };
        engine.run(req.clone()).await;

        let events = drain(&mut rx);
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "run.started",
                "run.stage",
                "run.stage",
                "suggestion",
                "run.finished"
            ]
        );
        let suggestion = events.iter().find(|e| e.event_type == "suggestion").unwrap();
        assert_eq!(suggestion.data["pipeline_id"], existing.id);
        assert_eq!(suggestion.data["score"], 1.0);
        let finished = events.last().unwrap();
        assert_eq!(finished.data["status"], "succeeded");

        // no generation happened: still exactly one pipeline
        let count = store
            .read(move |t| t.pipelines_for_flow(&flow_id).len())
            .await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn validation_errors_stop_the_run_before_persist() {
        let llm = Arc::new(StubLlm {
            draft: json!({"stages": [{"type": "source", "params": {}}]}),
        });
        let (engine, store, bus, flow_id, thread_id) = seeded(llm).await;
        let (mut rx, _) = bus.subscribe(&thread_id).await;

        let req = RunRequest {
            run_id: generate_id(),
            flow_id: flow_id.clone(),
            thread_id: thread_id.clone(),
            user_message: json!({"text": "make a pipeline"}),
            options: RunOptions::default(),
        };
        engine.run(req.clone()).await;

        let run = store
            .read({
                let id = req.run_id.clone();
                move |t| t.runs.get(&id).cloned()
            })
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let issues = store
            .read({
                let id = req.run_id.clone();
                move |t| {
                    t.issues_for_run(&id)
                        .into_iter()
                        .map(|i| (i.path.clone(), i.code.clone()))
                        .collect::<Vec<_>>()
                }
            })
            .await;
        assert!(issues.contains(&("/name".to_string(), "required".to_string())));
        assert!(issues.contains(&("/stages/0/name".to_string(), "required".to_string())));

        let count = store
            .read(move |t| t.pipelines_for_flow(&flow_id).len())
            .await;
        assert_eq!(count, 0);

        let events = drain(&mut rx);
        let issues_event = events.iter().find(|e| e.event_type == "issues").unwrap();
        assert!(issues_event.data["items"].as_array().unwrap().len() >= 2);
        let finished = events.last().unwrap();
        assert_eq!(finished.event_type, "run.finished");
        assert_eq!(finished.data["status"], "failed");
    }

    #[tokio::test]
    async fn publish_option_publishes_the_new_version() {
        let llm = Arc::new(MockLlm);
        let (engine, store, bus, flow_id, thread_id) = seeded(llm).await;
        let (mut rx, _) = bus.subscribe(&thread_id).await;

        let req = RunRequest {
            run_id: generate_id(),
            flow_id: flow_id.clone(),
            thread_id: thread_id.clone(),
            user_message: json!({"text": "make one and publish it"}),
            options: RunOptions { publish: true },
        };
        engine.run(req).await;

        let published = store
            .read(move |t| t.published_pipeline(&flow_id).map(|p| p.version.clone()))
            .await;
        assert_eq!(published.as_deref(), Some("1.0.0"));

        let types: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&"pipeline.published".to_string()));
    }

    #[tokio::test]
    async fn suggestion_short_circuit_records_a_finished_run() {
        let content = json!({"name": "p", "stages": [{"name": "load"}]});
        let llm = Arc::new(MockLlm);
        let (engine, store, bus, flow_id, thread_id) = seeded(llm).await;
        let vm = VersionManager::new("stable");
        let existing = store
            .transact({
                let flow_id = flow_id.clone();
                let content = content.clone();
                move |t| vm.create_version(t, &flow_id, &content, true)
            })
            .await
            .unwrap();

        let (mut rx, _) = bus.subscribe(&thread_id).await;
        let req = RunRequest {
            run_id: generate_id(),
            flow_id,
            thread_id: thread_id.clone(),
            user_message: json!({"content": content}),
            options: RunOptions::default(),
        };
        let suggestion = Suggestion {
            pipeline_id: existing.id.clone(),
            version: existing.version.clone(),
            score: 1.0,
        };
        engine.record_suggestion_run(&req, &suggestion).await.unwrap();

        let run = store
            .read({
                let id = req.run_id.clone();
                move |t| t.runs.get(&id).cloned()
            })
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.stage, RunStage::SearchExisting);

        let types: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                "run.started",
                "run.stage",
                "run.stage",
                "suggestion",
                "run.finished"
            ]
        );
    }
}
