//! Administrative HTTP surface (§6.2), consumed by the dashboard/CLI:
//! task CRUD and lifecycle actions, agent listing/eviction, stats, and
//! comment authoring. Every route sits behind [`crate::auth::require_secret`].

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use broker_core::error::BrokerError;
use broker_core::lifecycle::Lifecycle;
use broker_core::models::{MessageRole, MessageType, NewTask, TaskFilter, TaskMessage, TaskOrigin, TaskRouting};
use broker_core::registry::AgentRegistry;
use broker_core::store::Store;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::json_error_response;

#[derive(Clone)]
pub struct AdminState<S: Store> {
    pub lifecycle: Arc<Lifecycle<S>>,
    pub registry: Arc<AgentRegistry<S>>,
}

pub fn router<S: Store + 'static>(state: AdminState<S>) -> Router<AdminState<S>> {
    Router::new()
        .route("/tasks", post(enqueue_task).get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/approve", post(approve_task))
        .route("/tasks/:id/reject", post(reject_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/retry", post(retry_task))
        .route("/tasks/:id/unblock", post(unblock_task))
        .route("/tasks/:id/comments", post(add_comment))
        .route("/agents", get(list_agents))
        .route("/agents/:id/evict", post(evict_agent))
        .route("/stats", get(stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct EnqueueTaskBody {
    pub prompt: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub to: TaskRouting,
    #[serde(default)]
    pub priority: broker_core::models::Priority,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_submitter")]
    pub submitted_by: String,
}

fn default_submitter() -> String {
    "dashboard".to_string()
}

async fn enqueue_task<S: Store>(
    State(state): State<AdminState<S>>,
    Json(body): Json<EnqueueTaskBody>,
) -> Response {
    let new_task = NewTask {
        id: None,
        prompt: body.prompt,
        title: body.title,
        from: TaskOrigin::Human { id: body.submitted_by },
        to: body.to,
        priority: body.priority,
        context: body.context,
        dependencies: body.dependencies,
    };
    respond(state.lifecycle.enqueue(new_task).await)
}

async fn list_tasks<S: Store>(State(state): State<AdminState<S>>, Query(filter): Query<TaskFilter>) -> Response {
    respond(state.lifecycle.store().list_tasks(&filter).await)
}

async fn get_task<S: Store>(State(state): State<AdminState<S>>, Path(id): Path<String>) -> Response {
    respond(state.lifecycle.store().get_task(&id).await)
}

#[derive(Debug, Deserialize, Default)]
pub struct CommentBody {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn approve_task<S: Store>(
    State(state): State<AdminState<S>>,
    Path(id): Path<String>,
    body: Option<Json<CommentBody>>,
) -> Response {
    let comment = body.and_then(|Json(b)| b.comment);
    respond(state.lifecycle.approve(&id, comment).await)
}

async fn reject_task<S: Store>(
    State(state): State<AdminState<S>>,
    Path(id): Path<String>,
    body: Option<Json<CommentBody>>,
) -> Response {
    let reason = body.and_then(|Json(b)| b.reason).unwrap_or_else(|| "rejected".to_string());
    respond(state.lifecycle.reject(&id, reason).await)
}

async fn cancel_task<S: Store>(
    State(state): State<AdminState<S>>,
    Path(id): Path<String>,
    body: Option<Json<CommentBody>>,
) -> Response {
    let reason = body.and_then(|Json(b)| b.reason);
    respond(state.lifecycle.cancel(&id, reason).await)
}

async fn retry_task<S: Store>(State(state): State<AdminState<S>>, Path(id): Path<String>) -> Response {
    respond(state.lifecycle.retry(&id).await)
}

#[derive(Debug, Deserialize)]
pub struct UnblockBody {
    pub answer: String,
}

async fn unblock_task<S: Store>(
    State(state): State<AdminState<S>>,
    Path(id): Path<String>,
    Json(body): Json<UnblockBody>,
) -> Response {
    respond(state.lifecycle.answer(&id, body.answer).await)
}

#[derive(Debug, Deserialize)]
pub struct AddCommentBody {
    pub content: String,
}

async fn add_comment<S: Store>(
    State(state): State<AdminState<S>>,
    Path(id): Path<String>,
    Json(body): Json<AddCommentBody>,
) -> Response {
    let now = Utc::now();
    let message = TaskMessage::new(id, MessageRole::User, body.content, MessageType::Comment, now);
    respond(state.lifecycle.store().append_message(message).await)
}

async fn list_agents<S: Store>(State(state): State<AdminState<S>>) -> Response {
    respond(state.registry.list().await)
}

#[derive(Debug, Deserialize, Default)]
pub struct EvictBody {
    #[serde(default = "default_evict_reason")]
    pub reason: String,
}

fn default_evict_reason() -> String {
    "admin eviction".to_string()
}

async fn evict_agent<S: Store>(
    State(state): State<AdminState<S>>,
    Path(id): Path<String>,
    body: Option<Json<EvictBody>>,
) -> Response {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_else(default_evict_reason);
    match state.registry.evict(&id, &reason).await {
        Ok(event) => (StatusCode::OK, Json(json!({ "evicted": true, "event": event }))).into_response(),
        Err(e) => json_error_response(e),
    }
}

async fn stats<S: Store>(State(state): State<AdminState<S>>) -> Response {
    respond(state.lifecycle.store().stats().await)
}

fn respond<T: serde::Serialize>(result: Result<T, BrokerError>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(json!(value))).into_response(),
        Err(e) => json_error_response(e),
    }
}
