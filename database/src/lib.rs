//! SQLite implementation of the task broker's [`Store`](broker_core::store::Store)
//! trait: connection pooling, WAL mode, migrations, and the atomic
//! transaction patterns the state machine depends on for race-safe
//! reservations.
//!
//! # Usage
//!
//! ```rust,no_run
//! use broker_store_sqlite::SqliteStore;
//! use broker_core::store::Store;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::new(":memory:").await?;
//!     store.migrate().await?;
//!     store.health_check().await?;
//!     Ok(())
//! }
//! ```

mod common;
mod sqlite;

pub use sqlite::SqliteStore;

pub use broker_core::{
    error::{BrokerError, Result},
    models::{Agent, Priority, Task, TaskFilter, TaskMessage, TaskStatus},
    store::{Store, StoreStats, TaskMutation},
};
