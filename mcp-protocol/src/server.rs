//! Router wiring and the streaming interface (§6.3): assembles the tool
//! RPC endpoint, the admin surface, and the SSE event stream behind the
//! shared-secret middleware, the way the teacher's `server.rs` assembled
//! its SSE/JSON-RPC endpoints behind a single `Router`.

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use broker_core::eventbus::EventBus;
use broker_core::models::Event;
use broker_core::store::Store;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin::{self, AdminState};
use crate::auth::{require_secret, BrokerAuth};
use crate::error::json_error_response;
use crate::handler::{self, ToolContext};

#[derive(Clone)]
struct ServerState<S: Store> {
    tools: ToolContext<S>,
    admin: AdminState<S>,
    events: Arc<EventBus>,
}

/// Builds the full router: `/rpc` (tool surface), the admin routes under
/// `/` (§6.2), `/events` (§6.3), and an unauthenticated `/health`.
pub fn build_router<S: Store + 'static>(
    tools: ToolContext<S>,
    admin_state: AdminState<S>,
    events: Arc<EventBus>,
    auth: BrokerAuth,
) -> Router {
    let state = ServerState { tools, admin: admin_state.clone(), events };
    let admin_router = admin::router(admin_state.clone()).with_state(admin_state);

    let authenticated = Router::new()
        .route("/rpc", post(rpc_handler::<S>))
        .route("/events", get(events_handler::<S>))
        .with_state(state)
        .merge(admin_router)
        .layer(middleware::from_fn_with_state(auth, require_secret));

    Router::new()
        .route("/health", get(health_handler))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    op: String,
    #[serde(default)]
    params: Value,
}

async fn rpc_handler<S: Store + 'static>(
    State(state): State<ServerState<S>>,
    Json(request): Json<RpcRequest>,
) -> Response {
    info!(op = %request.op, "tool rpc request");
    match handler::dispatch(&state.tools, &request.op, request.params).await {
        Ok(result) => Json(json!({ "ok": true, "result": result })).into_response(),
        Err(e) => json_error_response(e),
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    #[serde(default)]
    since_seq: Option<i64>,
}

/// First frame is always `sync:full` carrying the current snapshot and
/// max seq (§6.3); subsequent frames are live events off the bus. A
/// lagged receiver (client fell behind the broadcast buffer) simply ends
/// its catch-up there — the client's own seq tracking notices the gap
/// and issues `request:sync` to reconnect and get a fresh snapshot.
async fn events_handler<S: Store + 'static>(
    State(state): State<ServerState<S>>,
    Query(_query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let store = state.tools.lifecycle.store().clone();
    let snapshot = async move {
        let tasks = store.list_tasks(&broker_core::models::TaskFilter::default()).await.unwrap_or_default();
        let agents = store.list_agents().await.unwrap_or_default();
        let seq = store.max_event_seq().await.unwrap_or(0);
        sse_json("sync:full", &json!({ "tasks": tasks, "agents": agents, "seq": seq }))
    };
    let initial = stream::once(snapshot).map(Ok);

    let rx = state.events.subscribe();
    let live = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok(sse_json(event_name(&event), &event))),
            Err(_lagged) => None,
        }
    });

    Sse::new(initial.chain(live)).keep_alive(KeepAlive::default())
}

fn event_name(event: &Event) -> &'static str {
    use broker_core::models::EventKind::*;
    match event.kind {
        TaskCreated => "task:created",
        TaskUpdated => "task:updated",
        TaskDeleted => "task:deleted",
        AgentStatus => "agent:status",
        SyncFull => "sync:full",
    }
}

fn sse_json(name: &str, payload: &impl serde::Serialize) -> SseEvent {
    SseEvent::default().event(name).data(serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string()))
}
