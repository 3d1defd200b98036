//! Wires the broker's components together (§2, §11): store, event bus,
//! lifecycle, poller, registry, scheduler, and the router that sits in
//! front of all of it — the same shape the teacher's `setup.rs` wired for
//! its repository/server pair, generalized to the new component graph.

use anyhow::{Context, Result};
use axum::Router;
use broker_core::capability_inference::NoopCapabilityInferrer;
use broker_core::eventbus::EventBus;
use broker_core::lifecycle::Lifecycle;
use broker_core::poller::{Notifier, Poller};
use broker_core::registry::AgentRegistry;
use broker_core::scheduler::Scheduler;
use broker_core::security::NoopScanner;
use broker_protocol::admin::AdminState;
use broker_protocol::auth::BrokerAuth;
use broker_protocol::handler::ToolContext;
use broker_protocol::server::build_router;
use broker_store_sqlite::SqliteStore;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;

/// Create the SQLite-backed store and run its migrations.
pub async fn create_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let database_url = config.database_url();
    info!("Using database URL: {}", database_url);

    let store = SqliteStore::new(&database_url)
        .await
        .context("Failed to create SQLite store")?;

    info!("Running database migrations");
    store.migrate().await.context("Failed to run database migrations")?;

    Ok(Arc::new(store))
}

/// The wired application: a ready-to-serve router plus the scheduler task
/// that must be spawned alongside it.
pub struct App {
    pub router: Router,
    pub scheduler: Arc<Scheduler<SqliteStore>>,
}

/// Build the full component graph from config: store, event bus,
/// lifecycle, poller, registry, scheduler, and the assembled router.
/// Runs restart recovery (§11) before returning so no stale
/// `PENDING_ACK`/`APPROVED_PENDING_ACK` task survives across a crash.
pub async fn initialize_app(config: &Config) -> Result<App> {
    info!("Initializing application");

    let store = create_store(config).await.context("Failed to create store")?;

    let events = Arc::new(EventBus::new(256));
    let notifier = Arc::new(Notifier::new());
    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        events.clone(),
        notifier.clone(),
        Arc::new(NoopScanner),
        Arc::new(NoopCapabilityInferrer),
    ));

    info!("Running restart recovery");
    lifecycle.recover().await.context("Failed to run restart recovery")?;

    let poller = Arc::new(Poller::new(lifecycle.clone(), notifier));
    let registry = Arc::new(AgentRegistry::new(store));

    let tools = ToolContext {
        lifecycle: lifecycle.clone(),
        poller,
        registry: registry.clone(),
        events: events.clone(),
    };
    let admin = AdminState { lifecycle: lifecycle.clone(), registry };

    let secret = resolve_auth_secret(config).context("Failed to resolve auth secret")?;
    let auth = BrokerAuth::new(secret);

    let router = build_router(tools, admin, events, auth);
    let scheduler = Arc::new(Scheduler::new(lifecycle, config.scheduler.to_scheduler_config()));

    info!("Application initialized successfully");
    Ok(App { router, scheduler })
}

/// Resolves the admin/tool-RPC shared secret (§6.2): an explicit
/// `config.auth.secret` wins; otherwise a secret is generated once and
/// persisted under the state directory so restarts reuse it.
pub fn resolve_auth_secret(config: &Config) -> Result<String> {
    if let Some(secret) = &config.auth.secret {
        return Ok(secret.clone());
    }

    let dir = state_dir()?;
    std::fs::create_dir_all(&dir).context("Failed to create state directory")?;
    let secret_path = dir.join("secret");

    if secret_path.exists() {
        let secret = std::fs::read_to_string(&secret_path).context("Failed to read persisted secret")?;
        Ok(secret.trim().to_string())
    } else {
        let secret = uuid::Uuid::new_v4().to_string();
        std::fs::write(&secret_path, &secret).context("Failed to persist generated secret")?;
        info!("Generated a new admin secret at {}", secret_path.display());
        Ok(secret)
    }
}

/// The `.broker` state directory (secret, and by default the database
/// file — see `Config::default_database_url`).
fn state_dir() -> Result<PathBuf> {
    let home = env::var("HOME").or_else(|_| env::var("USERPROFILE")).unwrap_or_else(|_| ".".to_string());
    Ok(PathBuf::from(home).join(".broker"))
}

/// Ensure the database directory exists using config
pub fn ensure_database_directory_from_config(config: &Config) -> Result<()> {
    let database_url = config.database_url();
    ensure_database_directory(&database_url)
}

/// Ensure the database directory exists
pub fn ensure_database_directory(database_url: &str) -> Result<()> {
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.exists() {
                info!("Creating database directory: {}", parent.display());
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }
    }
    Ok(())
}
