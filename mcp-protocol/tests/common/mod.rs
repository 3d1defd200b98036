//! Shared test harness: a full in-process stack wired the way
//! `broker-server`'s `setup.rs` wires it, backed by an in-memory SQLite
//! store so each test gets an isolated database.

use broker_core::capability_inference::NoopCapabilityInferrer;
use broker_core::eventbus::EventBus;
use broker_core::lifecycle::Lifecycle;
use broker_core::poller::{Notifier, Poller};
use broker_core::registry::AgentRegistry;
use broker_core::security::NoopScanner;
use broker_protocol::admin::AdminState;
use broker_protocol::auth::BrokerAuth;
use broker_protocol::handler::ToolContext;
use broker_protocol::server::build_router;
use broker_store_sqlite::SqliteStore;
use std::sync::Arc;

pub async fn store() -> Arc<SqliteStore> {
    let store = SqliteStore::new(":memory:").await.expect("open sqlite store");
    store.migrate().await.expect("migrate sqlite store");
    Arc::new(store)
}

pub async fn context() -> ToolContext<SqliteStore> {
    let store = store().await;
    let events = Arc::new(EventBus::new(256));
    let notifier = Arc::new(Notifier::new());
    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        events.clone(),
        notifier.clone(),
        Arc::new(NoopScanner),
        Arc::new(NoopCapabilityInferrer),
    ));
    let poller = Arc::new(Poller::new(lifecycle.clone(), notifier));
    let registry = Arc::new(AgentRegistry::new(store));
    ToolContext { lifecycle, poller, registry, events }
}

/// Binds the full router on an ephemeral port and returns its base URL
/// alongside the secret the caller must present.
pub async fn spawn_server() -> (String, String) {
    let ctx = context().await;
    let admin = AdminState { lifecycle: ctx.lifecycle.clone(), registry: ctx.registry.clone() };
    let events = ctx.events.clone();
    let secret = "test-secret".to_string();
    let auth = BrokerAuth::new(secret.clone());
    let app = build_router(ctx, admin, events, auth);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server exited");
    });

    (format!("http://{addr}"), secret)
}
