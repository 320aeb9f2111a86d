use std::convert::Infallible;

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use flowloom_core::event_bus::Replay;
use flowloom_core::{create_thread_with_snapshot, CoreError, RunRequest};
use flowloom_types::{
    ActivateChannelRequest, AgentRunRequest, CreateFlowRequest, CreateMessageRequest,
    CreateSchemaDefinitionRequest, Flow, FlowSummary, Message, RunAck, SchemaChannel,
    SchemaChannelView, SchemaDefinition, SchemaDefinitionBrief, Thread, ThreadSummary,
    UiEventRequest,
};

use crate::idempotency::{Lookup, StoredResponse};
use crate::AppState;

// ---- error envelope ----

/// Client-facing error: `{error: {code, message, details[]}}`. The request
/// path and method are appended to `details` by the outermost gate.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "details": [],
            }
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---- router ----

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/flows", get(list_flows).post(create_flow))
        .route("/flows/{id}", get(get_flow).delete(delete_flow))
        .route("/flows/{id}/threads", post(create_thread))
        .route("/flows/{id}/pipelines", get(list_flow_pipelines))
        .route("/flows/{id}/runs", get(list_flow_runs))
        .route("/flows/{id}/summary/active", get(get_active_flow_summary))
        .route("/threads/{id}", get(get_thread))
        .route(
            "/threads/{id}/messages",
            get(list_messages).post(create_message),
        )
        .route("/threads/{id}/agent/run", post(agent_run))
        .route("/threads/{id}/agent/event", post(agent_event))
        .route("/threads/{id}/events", get(thread_events))
        .route("/threads/{id}/close", post(close_thread))
        .route("/threads/{id}/summaries", get(list_thread_summaries))
        .route("/pipelines/{id}", get(get_pipeline))
        .route("/pipelines/{id}/publish", post(publish_pipeline))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route(
            "/schema/definitions",
            get(list_schema_definitions).post(create_schema_definition),
        )
        .route("/schema/channels", get(list_schema_channels))
        .route("/schema/channels/{name}", post(activate_schema_channel))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            idempotency_gate,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            size_limit_gate,
        ))
        .layer(middleware::from_fn(error_context_gate))
        .layer(cors)
        .with_state(state)
}

// ---- gates ----

/// Appends `{request: {path, method}}` to every error envelope on the way
/// out, so handlers and gates never have to.
async fn error_context_gate(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    if !(response.status().is_client_error() || response.status().is_server_error()) {
        return response;
    }
    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = to_bytes(body, usize::MAX).await else {
        return (parts.status, Body::empty()).into_response();
    };
    if let Ok(mut value) = serde_json::from_slice::<Value>(&bytes) {
        if let Some(details) = value
            .pointer_mut("/error/details")
            .and_then(Value::as_array_mut)
        {
            details.push(json!({"request": {"path": path, "method": method}}));
            if let Ok(rewritten) = serde_json::to_vec(&value) {
                parts.headers.remove(header::CONTENT_LENGTH);
                return Response::from_parts(parts, Body::from(rewritten));
            }
        }
    }
    Response::from_parts(parts, Body::from(bytes))
}

/// Rejects oversized bodies early using Content-Length when present.
async fn size_limit_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method();
    if matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        let declared = request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(size) = declared {
            let max = state.config.max_json_size;
            if size > max {
                return ApiError::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "PAYLOAD_TOO_LARGE",
                    format!("Request body too large: {size} > {max}"),
                )
                .into_response();
            }
        }
    }
    next.run(request).await
}

/// Bearer-token gate for mutating methods, active only when a shared token
/// is configured.
async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    let Some(expected) = state.config.auth_token.as_deref() else {
        return next.run(request).await;
    };
    if !matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    ) {
        return next.run(request).await;
    }
    let provided = extract_bearer(request.headers());
    if provided.as_deref() == Some(expected) {
        return next.run(request).await;
    }
    ApiError::from(CoreError::Unauthorized).into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let trimmed = auth.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// At-most-once gate for POSTs carrying an `Idempotency-Key`: the body is
/// buffered and fingerprinted, cache hits replay the stored response, and a
/// fingerprint mismatch within the TTL is a conflict.
async fn idempotency_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }
    let Some(key) = request
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, state.config.max_json_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "Request body exceeded the configured limit",
            )
            .into_response()
        }
    };
    let fingerprint: [u8; 32] = Sha256::digest(&bytes).into();
    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();

    match state
        .idempotency
        .lookup(&method, &path, &key, fingerprint)
        .await
    {
        Lookup::Replay(stored) => replay_response(stored),
        Lookup::Conflict => ApiError::from(CoreError::IdempotencyKeyReused).into_response(),
        Lookup::Miss => {
            let request = Request::from_parts(parts, Body::from(bytes));
            let response = next.run(request).await;
            let (response_parts, response_body) = response.into_parts();
            let Ok(response_bytes) = to_bytes(response_body, usize::MAX).await else {
                return (response_parts.status, Body::empty()).into_response();
            };
            let headers = response_parts
                .headers
                .iter()
                .filter(|(name, _)| **name != header::CONTENT_LENGTH)
                .map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
                .collect();
            state
                .idempotency
                .store(
                    &method,
                    &path,
                    &key,
                    fingerprint,
                    StoredResponse {
                        status: response_parts.status.as_u16(),
                        headers,
                        body: response_bytes.to_vec(),
                    },
                )
                .await;
            Response::from_parts(response_parts, Body::from(response_bytes))
        }
    }
}

fn replay_response(stored: StoredResponse) -> Response {
    let mut response = Response::new(Body::from(stored.body));
    *response.status_mut() =
        StatusCode::from_u16(stored.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in stored.headers {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

// ---- system ----

async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

async fn version(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"version": state.config.app_version}))
}

// ---- flows ----

async fn list_flows(State(state): State<AppState>) -> Json<Vec<Flow>> {
    let mut flows = state
        .store
        .read(|t| t.flows.values().cloned().collect::<Vec<_>>())
        .await;
    flows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(flows)
}

async fn create_flow(
    State(state): State<AppState>,
    Json(req): Json<CreateFlowRequest>,
) -> ApiResult<(StatusCode, Json<Flow>)> {
    let mut flow = Flow::new(req.slug, req.name);
    if let Some(meta) = req.meta {
        flow.meta = meta;
    }
    let created = flow.clone();
    state.store.transact(move |t| t.insert_flow(flow)).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_flow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Flow>> {
    let flow = state.store.read(move |t| t.flow(&id).cloned()).await?;
    Ok(Json(flow))
}

async fn delete_flow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.store.transact(move |t| t.delete_flow(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ListPipelinesQuery {
    published: Option<u8>,
}

async fn list_flow_pipelines(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListPipelinesQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    let published_only = query.published == Some(1);
    let rows = state
        .store
        .read(move |t| {
            t.flow(&id)?;
            Ok::<Vec<serde_json::Value>, CoreError>(t.pipelines_for_flow(&id)
                .into_iter()
                .filter(|p| !published_only || p.is_published)
                .map(|p| {
                    json!({
                        "id": p.id,
                        "version": p.version,
                        "status": p.status,
                        "is_published": p.is_published,
                        "created_at": p.created_at.to_rfc3339(),
                    })
                })
                .collect::<Vec<_>>())
        })
        .await?;
    Ok(Json(rows))
}

async fn get_active_flow_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<FlowSummary>>> {
    let summary = state
        .store
        .read(move |t| {
            t.flow(&id)?;
            Ok::<Option<FlowSummary>, CoreError>(t.active_flow_summary(&id).cloned())
        })
        .await?;
    Ok(Json(summary))
}

// ---- threads ----

async fn create_thread(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> ApiResult<(StatusCode, Json<Thread>)> {
    let thread =
        create_thread_with_snapshot(&state.store, &flow_id, &state.config.schema_channel).await?;
    Ok((StatusCode::CREATED, Json(thread)))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Thread>> {
    let thread = state.store.read(move |t| t.thread(&id).cloned()).await?;
    Ok(Json(thread))
}

async fn list_thread_summaries(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ThreadSummary>>> {
    let rows = state
        .store
        .read(move |t| {
            t.thread(&id)?;
            Ok::<Vec<ThreadSummary>, CoreError>(t.summaries_for_thread(&id)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>())
        })
        .await?;
    Ok(Json(rows))
}

async fn close_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let out = state.summarizer.close_thread(&id).await?;
    Ok(Json(serde_json::to_value(out).unwrap_or_default()))
}

// ---- messages ----

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<usize>,
    before: Option<String>,
}

fn message_payload(m: &Message) -> Value {
    json!({
        "id": m.id,
        "role": m.role,
        "format": m.format,
        "content": m.content,
        "created_at": m.created_at.to_rfc3339(),
        "parent_id": m.parent_id,
        "tool_name": m.tool_name,
        "tool_result": m.tool_result,
    })
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Response> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let before = query.before.clone();
    let (rows, next_cursor) = state
        .store
        .read(move |t| {
            t.thread(&id)?;
            let all = t.messages_for_thread(&id);
            let cutoff = before
                .as_deref()
                .and_then(|bid| all.iter().position(|m| m.id == bid));
            let visible: Vec<_> = match cutoff {
                Some(idx) => all[..idx].to_vec(),
                None => all,
            };
            // newest `limit` of the window, still oldest-first within the page
            let start = visible.len().saturating_sub(limit);
            let page: Vec<Value> = visible[start..]
                .iter()
                .map(|m| message_payload(m))
                .collect();
            // older history remains; the cursor is the oldest id returned
            let next = (start > 0).then(|| visible[start].id.clone());
            Ok::<(Vec<Value>, Option<String>), CoreError>((page, next))
        })
        .await?;

    let mut response = Json(rows).into_response();
    if let Some(cursor) = next_cursor {
        if let Ok(value) = HeaderValue::from_str(&cursor) {
            response.headers_mut().insert("x-next-cursor", value);
        }
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct CreateMessageQuery {
    run: Option<u8>,
}

async fn create_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CreateMessageQuery>,
    Json(req): Json<CreateMessageRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let message = state.intake.add_user_message(&id, req).await?;
    let mut payload = message_payload(&message);

    if query.run == Some(1) {
        let flow_id = state
            .store
            .read({
                let id = id.clone();
                move |t| t.thread(&id).map(|thread| thread.flow_id.clone())
            })
            .await?;
        let run_id = Uuid::new_v4().to_string();
        let run_req = RunRequest {
            run_id: run_id.clone(),
            flow_id,
            thread_id: id,
            user_message: json!({
                "role": message.role,
                "format": message.format,
                "content": message.content,
            }),
            options: Default::default(),
        };
        state.engine.spawn(run_req);
        payload["run"] = json!({"run_id": run_id, "status": "queued"});
    }

    Ok((StatusCode::CREATED, Json(payload)))
}

// ---- agent ----

async fn agent_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AgentRunRequest>,
) -> ApiResult<Json<Value>> {
    let flow_id = state
        .store
        .read({
            let id = id.clone();
            move |t| t.thread(&id).map(|thread| thread.flow_id.clone())
        })
        .await?;
    let run_id = Uuid::new_v4().to_string();
    let run_req = RunRequest {
        run_id: run_id.clone(),
        flow_id: flow_id.clone(),
        thread_id: id,
        user_message: req.user_message.clone(),
        options: req.options.unwrap_or_default(),
    };

    // Suggestion fast-path: when a candidate already exists the run is
    // recorded synchronously and the suggestion returned inline.
    let matcher = state.matcher.clone();
    let candidate = state
        .store
        .read({
            let user_message = req.user_message.clone();
            move |t| matcher.find_candidate(t, &flow_id, &user_message)
        })
        .await;
    if let Some(suggestion) = candidate {
        state.engine.record_suggestion_run(&run_req, &suggestion).await?;
        return Ok(Json(json!({"ok": false, "suggestion": suggestion})));
    }

    state.engine.spawn(run_req);
    Ok(Json(
        serde_json::to_value(RunAck {
            run_id,
            status: "queued".to_string(),
        })
        .unwrap_or_default(),
    ))
}

async fn agent_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(event): Json<UiEventRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state
        .store
        .read({
            let id = id.clone();
            move |t| t.thread(&id).map(|_| ())
        })
        .await?;
    let message = match event.kind.to_lowercase().as_str() {
        "action.click" => match event.action_id.as_deref() {
            Some(action) if !action.is_empty() => format!("Action \"{action}\" accepted"),
            _ => "Action accepted".to_string(),
        },
        "choice.submit" => match event.payload.as_ref().and_then(|p| p.get("value")) {
            Some(value) => format!("Choice {value} submitted"),
            None => "Choice submitted".to_string(),
        },
        "card.open" => match event.url.as_deref() {
            Some(url) if !url.is_empty() => format!("Open card {url}"),
            _ => "Open card".to_string(),
        },
        other => format!("Event {other} received"),
    };
    state
        .bus
        .publish(
            &id,
            "ui.ack",
            json!({
                "kind": event.kind,
                "msg": message,
                "event": serde_json::to_value(&event).unwrap_or_default(),
            }),
        )
        .await;
    Ok((StatusCode::ACCEPTED, Json(json!({"ok": true}))))
}

// ---- pipelines ----

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let pipeline = state.store.read(move |t| t.pipeline(&id).cloned()).await?;
    Ok(Json(json!({
        "id": pipeline.id,
        "flow_id": pipeline.flow_id,
        "version": pipeline.version,
        "status": pipeline.status,
        "is_published": pipeline.is_published,
        "schema_version": pipeline.schema_version,
        "schema_def_id": pipeline.schema_def_id,
        "content": pipeline.content,
    })))
}

async fn publish_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let out = state.versions.publish(&state.store, &id).await?;
    Ok(Json(serde_json::to_value(out).unwrap_or_default()))
}

// ---- runs ----

fn run_payload(run: &flowloom_types::GenerationRun, issues: Vec<Value>) -> Value {
    json!({
        "id": run.id,
        "flow_id": run.flow_id,
        "thread_id": run.thread_id,
        "pipeline_id": run.pipeline_id,
        "stage": run.stage,
        "status": run.status,
        "result": run.result,
        "error": run.error,
        "created_at": run.created_at.to_rfc3339(),
        "started_at": run.started_at.map(|t| t.to_rfc3339()),
        "finished_at": run.finished_at.map(|t| t.to_rfc3339()),
        "issues": issues,
    })
}

fn issue_payload(issue: &flowloom_types::ValidationIssue) -> Value {
    json!({
        "path": issue.path,
        "code": issue.code,
        "severity": issue.severity,
        "message": issue.message,
    })
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let payload = state
        .store
        .read(move |t| {
            let run = t.run(&id)?.clone();
            let issues = t.issues_for_run(&id).into_iter().map(issue_payload).collect();
            Ok::<Value, CoreError>(run_payload(&run, issues))
        })
        .await?;
    Ok(Json(payload))
}

async fn list_flow_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Value>>> {
    let rows = state
        .store
        .read(move |t| {
            t.flow(&id)?;
            let mut runs: Vec<&flowloom_types::GenerationRun> =
                t.runs.values().filter(|r| r.flow_id == id).collect();
            runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok::<Vec<Value>, CoreError>(runs
                .into_iter()
                .map(|r| run_payload(r, Vec::new()))
                .collect::<Vec<_>>())
        })
        .await?;
    Ok(Json(rows))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let canceled = state.engine.cancel_run(&id).await?;
    Ok(Json(json!({"ok": true, "canceled": canceled})))
}

// ---- schema registry ----

async fn list_schema_definitions(State(state): State<AppState>) -> Json<Vec<Value>> {
    let mut rows = state
        .store
        .read(|t| {
            t.schema_defs
                .values()
                .map(|d| {
                    json!({
                        "id": d.id,
                        "name": d.name,
                        "version": d.version,
                        "status": d.status,
                        "compat_with": d.compat_with,
                        "created_at": d.created_at.to_rfc3339(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .await;
    rows.sort_by_key(|v| {
        (
            v["name"].as_str().unwrap_or_default().to_string(),
            v["version"].as_str().unwrap_or_default().to_string(),
        )
    });
    Json(rows)
}

async fn create_schema_definition(
    State(state): State<AppState>,
    Json(req): Json<CreateSchemaDefinitionRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let mut def = SchemaDefinition::new(req.name, req.version, req.json);
    def.compat_with = req.compat_with;
    let created = def.clone();
    state
        .store
        .transact(move |t| t.insert_schema_def(def))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": created.id,
            "name": created.name,
            "version": created.version,
            "status": created.status,
        })),
    ))
}

fn channel_view(t: &flowloom_core::Tables, name: &str, def_id: &str) -> SchemaChannelView {
    SchemaChannelView {
        name: name.to_string(),
        active_schema_def_id: def_id.to_string(),
        definition: t.schema_defs.get(def_id).map(|d| SchemaDefinitionBrief {
            id: d.id.clone(),
            name: d.name.clone(),
            version: d.version.clone(),
        }),
    }
}

async fn list_schema_channels(State(state): State<AppState>) -> Json<Vec<SchemaChannelView>> {
    let mut rows = state
        .store
        .read(|t| {
            t.schema_channels
                .values()
                .map(|c| channel_view(t, &c.name, &c.active_schema_def_id))
                .collect::<Vec<_>>()
        })
        .await;
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    Json(rows)
}

async fn activate_schema_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ActivateChannelRequest>,
) -> ApiResult<Json<SchemaChannelView>> {
    let def_id = req.schema_def_id.clone();
    let view = state
        .store
        .transact(move |t| {
            t.schema_def(&def_id)?;
            t.upsert_channel(SchemaChannel::new(name.clone(), def_id.clone()))?;
            Ok(channel_view(t, &name, &def_id))
        })
        .await?;
    Ok(Json(view))
}

// ---- events (SSE) ----

async fn thread_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let header = headers.get("last-event-id").map(|v| v.to_str().ok());
    let last_event_id = match header {
        Some(raw) => match raw.and_then(|v| v.parse::<i64>().ok()) {
            Some(since) if state.bus.can_replay(&id, since).await => Some(since),
            // present but unreplayable (or unparsable): resync from scratch
            _ => return StatusCode::NO_CONTENT.into_response(),
        },
        None => None,
    };

    // Subscribe before replaying so nothing published in between is lost;
    // the live loop skips anything the replay already delivered.
    let (rx, _) = state.bus.subscribe(&id).await;
    let replayed = match last_event_id {
        Some(since) => match state.bus.replay(&id, since).await {
            Replay::Events(events) => events,
            Replay::CannotReplay => Vec::new(),
        },
        None => Vec::new(),
    };
    let ping_interval = state.config.sse_ping_interval;

    let stream = sse_stream(replayed, rx, ping_interval);
    Sse::new(stream).into_response()
}

fn sse_stream(
    replayed: Vec<flowloom_types::BusEvent>,
    mut rx: tokio::sync::broadcast::Receiver<flowloom_types::BusEvent>,
    ping_interval: std::time::Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    use tokio::sync::broadcast::error::RecvError;

    async_stream::stream! {
        let mut last_sent: u64 = 0;
        for event in replayed {
            last_sent = event.cursor;
            yield Ok(to_sse_event(&event));
        }
        yield Ok(Event::default().event("ping").data(""));
        loop {
            match tokio::time::timeout(ping_interval, rx.recv()).await {
                Err(_) => yield Ok(Event::default().event("ping").data("")),
                Ok(Ok(event)) => {
                    if event.cursor <= last_sent {
                        continue;
                    }
                    last_sent = event.cursor;
                    yield Ok(to_sse_event(&event));
                }
                // tail-drop under overflow: skip what was lost, keep going
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => break,
            }
        }
    }
}

fn to_sse_event(event: &flowloom_types::BusEvent) -> Event {
    Event::default()
        .event(&event.event_type)
        .id(event.cursor.to_string())
        .data(serde_json::to_string(&event.sse_payload()).unwrap_or_default())
}
