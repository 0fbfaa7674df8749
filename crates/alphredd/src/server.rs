//! HTTP API for the chat process.
//!
//! Local-only REST endpoints for chatting and for creating and inspecting
//! delegated tasks. Task execution happens in the worker process.

use std::net::SocketAddr;
use std::sync::Arc;

use alphred_core::events::{EventPayload, TaskCreatedPayload};
use alphred_core::{Id, Task, TaskEvent, TaskStatus};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::chat::{ChatError, ChatService};
use crate::storage::{Storage, StorageError};

/// Header accepted in place of `Authorization: Bearer`.
pub const TOKEN_HEADER: &str = "x-alphred-token";

const DEFAULT_LIST_LIMIT: u32 = 20;
const MAX_LIST_LIMIT: u32 = 200;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub chat: Arc<ChatService>,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/events", get(list_events))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .or_else(|| headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn storage_error(context: &str, err: StorageError) -> ApiError {
    match err {
        StorageError::TaskNotFound(_) => api_error(StatusCode::NOT_FOUND, err.to_string()),
        other => {
            error!(error = %other, "{context}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {other}"))
        }
    }
}

// --- Request/Response types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListEventsResponse {
    pub events: Vec<TaskEvent>,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /chat
async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    match state.chat.respond(&req.message).await {
        Ok(reply) => Ok(Json(reply)),
        Err(ChatError::EmptyMessage) => {
            Err(api_error(StatusCode::BAD_REQUEST, "message cannot be empty"))
        }
        Err(err @ (ChatError::Llm(_) | ChatError::LlmTimeout(_))) => {
            warn!(error = %err, "chat request failed");
            Err(api_error(StatusCode::BAD_GATEWAY, err.to_string()))
        }
        Err(err) => {
            error!(error = %err, "chat request failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

/// POST /tasks
async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let title = req.title.trim();
    if title.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "title cannot be empty"));
    }

    let task = Task::new(title, req.description);
    state
        .storage
        .insert_task(&task)
        .await
        .map_err(|e| storage_error("failed to create task", e))?;

    let payload = EventPayload::TaskCreated(TaskCreatedPayload {
        title: task.title.clone(),
    });
    if let Err(e) = state.storage.append_event(&task.id, &payload).await {
        warn!(task_id = %task.id, error = %e, "failed to record task event");
    }

    info!(task_id = %task.id, title = %task.title, "task created");
    Ok((StatusCode::CREATED, Json(TaskResponse { task })))
}

/// GET /tasks
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("unknown status '{raw}'"))
        })?),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let tasks = state
        .storage
        .list_tasks(status, limit)
        .await
        .map_err(|e| storage_error("failed to list tasks", e))?;

    Ok(Json(ListTasksResponse { tasks }))
}

/// GET /tasks/{id}
async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task = state
        .storage
        .get_task(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("failed to load task", e))?;

    Ok(Json(TaskResponse { task }))
}

/// GET /tasks/{id}/events
async fn list_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    state
        .storage
        .get_task(&task_id)
        .await
        .map_err(|e| storage_error("failed to load task", e))?;

    let events = state
        .storage
        .list_events(&task_id)
        .await
        .map_err(|e| storage_error("failed to list events", e))?;

    Ok(Json(ListEventsResponse { events }))
}
