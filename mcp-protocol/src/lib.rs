//! Transport layer for the multi-agent task broker: the tool RPC
//! registry agents call into, the administrative HTTP surface the
//! dashboard/CLI calls into, shared-secret authentication for both, and
//! the SSE streaming interface that keeps a dashboard in sync.
//!
//! # Usage
//!
//! ```rust,no_run
//! use broker_protocol::auth::BrokerAuth;
//! use broker_protocol::admin::AdminState;
//! use broker_protocol::handler::ToolContext;
//! use broker_protocol::server::build_router;
//!
//! # async fn wire<S: broker_core::store::Store + 'static>(
//! #     tools: ToolContext<S>,
//! #     admin: AdminState<S>,
//! #     events: std::sync::Arc<broker_core::eventbus::EventBus>,
//! # ) {
//! let auth = BrokerAuth::new("shared-secret-from-config");
//! let app = build_router(tools, admin, events, auth);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();
//! axum::serve(listener, app).await.unwrap();
//! # }
//! ```

pub mod admin;
pub mod auth;
pub mod error;
pub mod handler;
pub mod server;

pub use error::json_error_response;
pub use handler::{dispatch, ToolContext};
pub use server::build_router;
