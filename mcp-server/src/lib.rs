//! Broker server library.
//!
//! Wires the broker's components (store, lifecycle, poller, registry,
//! scheduler, router) together from configuration and exposes the
//! resulting `App` for `main.rs` to serve.

pub mod config;
pub mod setup;
pub mod telemetry;

pub use config::Config;
pub use setup::{create_store, ensure_database_directory, initialize_app, App};
pub use telemetry::init_telemetry;
