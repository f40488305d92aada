//! HTTP admission surface (spec.md §6, SPEC_FULL.md §6), grounded in
//! `factory::api::api_router`/`AppState`/`ApiError`: a three-variant error
//! enum mapped to status codes, a `SharedState = Arc<AppState>` extractor,
//! and a WebSocket route for live log streaming.
//!
//! This binary trusts an upstream reverse proxy to have already
//! authenticated the caller and to forward the resolved principal as
//! `X-Principal-Id`/`X-Principal-Email` headers — it never decodes a
//! session cookie or runs an OAuth handshake itself (spec.md's explicit
//! non-goal).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::admission::{Admission, CreateTaskRequest};
use crate::errors::AdmissionError;
use crate::logsink::LogSink;
use crate::redact::Redactor;
use crate::store::DbHandle;
use crate::task::{AgentKind, SandboxProviderKind, Task, TaskId};

pub struct AppState {
    pub admission: Admission,
    pub db: DbHandle,
    pub log_sink: LogSink,
}

pub type SharedState = Arc<AppState>;

pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/tasks", post(create_task_handler))
        .route("/api/tasks/{id}", get(get_task_handler))
        .route("/api/tasks/{id}/cancel", post(cancel_task_handler))
        .route("/api/tasks/{id}/messages", post(follow_up_handler))
        .route("/api/tasks/{id}/logs/client", post(client_log_handler))
        .route("/api/tasks/{id}/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    RateLimited { reset_at: chrono::DateTime<chrono::Utc> },
    NotFound(String),
    Internal(String),
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Unauthorized => ApiError::Unauthorized,
            AdmissionError::RateLimitExceeded { reset_at } => ApiError::RateLimited { reset_at },
            AdmissionError::InvalidInput(msg) => ApiError::BadRequest(msg),
            AdmissionError::NotFound(id) => ApiError::NotFound(id),
            AdmissionError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::RateLimited { reset_at } => {
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({
                    "error": "rate limit exceeded",
                    "resetAt": reset_at,
                }))).into_response();
                if let Ok(value) = reset_at.to_rfc3339().parse() {
                    response.headers_mut().insert("X-RateLimit-Reset", value);
                }
                return response;
            }
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("task not found: {id}")),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}

struct Principal {
    user_id: String,
    email: String,
}

fn extract_principal(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let user_id = headers
        .get("x-principal-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::Unauthorized)?
        .to_string();
    let email = headers
        .get("x-principal-email")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Ok(Principal { user_id, email })
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct CreateTaskBody {
    prompt: String,
    #[serde(rename = "repoUrl")]
    repo_url: String,
    #[serde(rename = "selectedAgent")]
    selected_agent: AgentKind,
    #[serde(rename = "selectedModel")]
    selected_model: Option<String>,
    #[serde(rename = "sandboxProvider")]
    sandbox_provider: SandboxProviderKind,
    #[serde(rename = "existingBranchName")]
    existing_branch_name: Option<String>,
    #[serde(rename = "keepAlive", default)]
    keep_alive: bool,
    #[serde(rename = "maxDuration", default = "default_max_duration")]
    max_duration: String,
    #[serde(rename = "mcpServerIds", default)]
    mcp_server_ids: Vec<String>,
    #[serde(rename = "installDependencies", default = "default_true")]
    install_dependencies: bool,
}

fn default_max_duration() -> String {
    "30m".to_string()
}

fn default_true() -> bool {
    true
}

async fn create_task_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = extract_principal(&headers)?;
    let task = state
        .admission
        .create_task(CreateTaskRequest {
            user_id: principal.user_id,
            email: principal.email,
            prompt: body.prompt,
            repo_url: body.repo_url,
            selected_agent: body.selected_agent,
            selected_model: body.selected_model,
            sandbox_provider: body.sandbox_provider,
            existing_branch_name: body.existing_branch_name,
            keep_alive: body.keep_alive,
            max_duration: body.max_duration,
            mcp_server_ids: body.mcp_server_ids,
            install_dependencies: body.install_dependencies,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task_handler(State(state): State<SharedState>, Path(id): Path<TaskId>) -> Result<impl IntoResponse, ApiError> {
    let task = load_task(&state, &id).await?;
    Ok(Json(task))
}

async fn cancel_task_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = extract_principal(&headers)?;
    state.admission.cancel_task(&id, &principal.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct FollowUpBody {
    content: String,
}

async fn follow_up_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<TaskId>,
    Json(body): Json<FollowUpBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = extract_principal(&headers)?;
    state.admission.append_follow_up(&id, &principal.user_id, &body.content).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ClientLogBody {
    message: String,
}

async fn client_log_handler(
    State(state): State<SharedState>,
    Path(id): Path<TaskId>,
    Json(body): Json<ClientLogBody>,
) -> Result<impl IntoResponse, ApiError> {
    load_task(&state, &id).await?;
    let redactor = Redactor::new();
    state
        .log_sink
        .append_client(&id, &redactor, &body.message)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_task(state: &SharedState, id: &TaskId) -> Result<Task, ApiError> {
    let db = state.db.clone();
    let task_id = id.clone();
    db.call(move |conn| conn.get_task(&task_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(id.clone()))
}

#[derive(Serialize)]
struct LogFrame {
    #[serde(flatten)]
    entry: crate::task::LogEntry,
}

async fn ws_handler(State(state): State<SharedState>, Path(id): Path<TaskId>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_logs(socket, state, id))
}

/// Poll the Log Sink until the task reaches a terminal status, pushing
/// only newly appended entries each tick. Grounded in `factory::ws`'s
/// push-on-change shape, adapted from a broadcast-channel subscription to
/// polling since the Log Sink has no publish side of its own.
async fn stream_logs(mut socket: WebSocket, state: SharedState, task_id: TaskId) {
    let mut sent = 0usize;
    loop {
        let logs = match state.log_sink.read_all(&task_id).await {
            Ok(logs) => logs,
            Err(_) => break,
        };
        for entry in logs.iter().skip(sent) {
            let frame = LogFrame { entry: entry.clone() };
            let Ok(json) = serde_json::to_string(&frame) else { continue };
            if socket.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        sent = logs.len();

        let db = state.db.clone();
        let id = task_id.clone();
        let status = db.call(move |conn| conn.get_task_status(&id)).await.ok().flatten();
        if status.map(|s| s.is_terminal()).unwrap_or(true) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}
