//! Broker Core Library
//!
//! Domain models, persistence trait, matching, and lifecycle/scheduling
//! logic for the multi-agent task broker. Every transport-facing crate
//! (`broker-protocol`, `broker-server`) and every storage backend
//! (`broker-store-sqlite`) builds on the types and traits defined here.
//!
//! # Architecture
//!
//! - [`models`] — domain types: `Task`, `Agent`, `TaskMessage`, `Event`, ...
//! - [`error`] — `BrokerError` and the crate-wide `Result` alias
//! - [`store`] — the `Store` trait: atomic persistence, no policy
//! - [`validation`] — stateless input validation and cycle detection
//! - [`matching`] — pure capability/workspace/dependency matching predicates
//! - [`registry`] — agent identity, heartbeat, and eviction bookkeeping
//! - [`lifecycle`] — the policy layer: every task state transition
//! - [`scheduler`] — the periodic reconciliation loop (reaping, matching)
//! - [`poller`] — long-poll wait/wake plumbing for `wait_for_task`
//! - [`eventbus`] — sequenced broadcast of state-change events
//! - [`security`] — pluggable prompt scanning
//! - [`capability_inference`] — pluggable capability inference from prompt text
//!
//! # Example
//!
//! ```rust
//! use broker_core::{
//!     models::{NewTask, TaskOrigin},
//!     validation::Validator,
//! };
//!
//! let new_task = NewTask {
//!     id: None,
//!     prompt: "Design the overall system architecture".to_string(),
//!     title: None,
//!     from: TaskOrigin::Human { id: "u1".to_string() },
//!     to: Default::default(),
//!     priority: Default::default(),
//!     context: serde_json::json!({}),
//!     dependencies: vec![],
//! };
//!
//! Validator::validate_new_task(&new_task).unwrap();
//! ```

pub mod capability_inference;
pub mod error;
pub mod eventbus;
pub mod lifecycle;
pub mod matching;
pub mod models;
pub mod poller;
pub mod registry;
pub mod scheduler;
pub mod security;
pub mod store;
pub mod validation;

pub use error::{BrokerError, Result};
pub use eventbus::EventBus;
pub use lifecycle::{Lifecycle, TaskContext};
pub use matching::MatchingService;
pub use models::{Agent, NewAgent, NewTask, Task, TaskFilter, TaskPatch, TaskStatus};
pub use poller::{Notifier, Poller};
pub use registry::AgentRegistry;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::Store;
pub use validation::Validator;

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(CRATE_NAME, "broker-core");
    }

    #[test]
    fn test_re_exports() {
        use crate::{BrokerError, TaskStatus};

        let status = TaskStatus::Queued;
        assert_eq!(format!("{status}"), "QUEUED");

        let error = BrokerError::task_not_found("T1");
        assert!(error.is_not_found());
    }
}
