use crate::models::TaskStatus;
use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error kinds for the task broker.
///
/// Every operation that can fail returns one of these variants; nothing
/// propagates to a caller as an unstructured panic.
///
/// # Examples
///
/// ```rust
/// use broker_core::error::BrokerError;
///
/// let not_found = BrokerError::not_found("T1");
/// assert!(not_found.is_not_found());
/// assert_eq!(not_found.status_code(), 404);
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// No entity exists with the given identifier
    #[error("not found: {0}")]
    NotFound(String),

    /// An illegal transition or a stale precondition
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// The prompt security scanner flagged the content
    #[error("blocked: {0}")]
    Blocked(String),

    /// A review submission is missing a required diff
    #[error("missing diff: {0}")]
    MissingDiff(String),

    /// An operation requires an acknowledged task but it was never acked
    #[error("not acked: {0}")]
    NotAcked(String),

    /// Malformed input
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Caller is not permitted to perform the operation
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Anything else — persistence failures, invariant violations
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("no entity with id '{id}'"))
    }

    pub fn task_not_found(task_id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("task '{task_id}' not found"))
    }

    pub fn agent_not_found(agent_id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("agent '{agent_id}' not found"))
    }

    pub fn invalid_transition(from: TaskStatus, to: TaskStatus) -> Self {
        Self::StateConflict(format!("illegal transition from {from} to {to}"))
    }

    pub fn precondition_drifted(task_id: impl std::fmt::Display) -> Self {
        Self::StateConflict(format!(
            "preconditions for task '{task_id}' no longer hold"
        ))
    }

    pub fn missing_diff(task_id: impl std::fmt::Display) -> Self {
        Self::MissingDiff(format!(
            "task '{task_id}' requires a non-trivial diff to enter review"
        ))
    }

    pub fn not_acked(task_id: impl std::fmt::Display) -> Self {
        Self::NotAcked(format!("task '{task_id}' has not been acknowledged"))
    }

    pub fn empty_field(field: &str) -> Self {
        Self::ValidationError(format!("field '{field}' cannot be empty"))
    }

    pub fn invalid_format(field: &str, value: &str) -> Self {
        Self::ValidationError(format!("field '{field}' has invalid format: '{value}'"))
    }

    pub fn cyclic_dependencies(task_id: impl std::fmt::Display) -> Self {
        Self::ValidationError(format!(
            "task '{task_id}' dependencies form a cycle"
        ))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, BrokerError::StateConflict(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, BrokerError::ValidationError(_))
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, BrokerError::Blocked(_))
    }

    /// Convert to an HTTP status code for the admin/tool RPC surfaces.
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::NotFound(_) => 404,
            BrokerError::StateConflict(_) => 409,
            BrokerError::Blocked(_) => 451,
            BrokerError::MissingDiff(_) => 422,
            BrokerError::NotAcked(_) => 409,
            BrokerError::ValidationError(_) => 400,
            BrokerError::Unauthorized(_) => 401,
            BrokerError::Internal(_) => 500,
        }
    }

    /// Semantic kind name, used in structured error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::NotFound(_) => "NotFound",
            BrokerError::StateConflict(_) => "StateConflict",
            BrokerError::Blocked(_) => "Blocked",
            BrokerError::MissingDiff(_) => "MissingDiff",
            BrokerError::NotAcked(_) => "NotAcked",
            BrokerError::ValidationError(_) => "ValidationError",
            BrokerError::Unauthorized(_) => "Unauthorized",
            BrokerError::Internal(_) => "Internal",
        }
    }
}
