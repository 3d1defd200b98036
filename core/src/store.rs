//! The `Store` trait: atomic persistence and indexed retrieval for every
//! entity in §3. Implementations contain no policy — callers (chiefly
//! `Lifecycle` and `Scheduler`) decide what is legal; the Store only
//! guarantees that a given write either fully lands or fully rolls back.

use crate::error::Result;
use crate::models::{
    Agent, AgentId, AgentStatus, Event, EventKind, Eviction, MessageId, NewAgent, PendingAck,
    ReviewComment, SystemPrompt, Task, TaskFilter, TaskId, TaskMessage, TaskResponse, TaskStatus,
    WaitingAgent, WorkspaceContext,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// An optional-field change to an existing field. `Keep` makes no change;
/// `Set(None)` clears an `Option` field; `Set(Some(v))` assigns it.
#[derive(Debug, Clone)]
pub enum Patch<T> {
    Keep,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

/// The full set of side effects a single legal Lifecycle transition may
/// apply, computed entirely by `Lifecycle` (the policy layer) and executed
/// atomically by the Store. One `TaskMutation` = one transaction.
#[derive(Debug, Clone, Default)]
pub struct TaskMutation {
    pub new_status: Option<TaskStatus>,
    pub set_agent_id: Patch<Option<AgentId>>,
    pub response: Patch<Option<TaskResponse>>,
    pub history_message: Option<String>,
    pub append_message: Option<TaskMessage>,
    pub workspace_id: Patch<Option<String>>,
    pub required_capabilities: Option<Vec<String>>,
    /// When true the pending-ack row for this task (if any) is removed as
    /// part of the same transaction.
    pub clear_pending_ack: bool,
}

/// Aggregate counts for the admin `GET /stats` surface.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_tasks: u64,
    pub tasks_by_status: HashMap<TaskStatus, u64>,
    pub tasks_by_agent: HashMap<AgentId, u64>,
    pub waiting_agents: u64,
    pub pending_acks: u64,
    pub max_event_seq: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ---- Tasks --------------------------------------------------------

    async fn insert_task(&self, task: Task) -> Result<Task>;
    async fn get_task(&self, id: &str) -> Result<Task>;
    async fn find_task(&self, id: &str) -> Result<Option<Task>>;
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// QUEUED ∪ APPROVED_QUEUED, ordered priority desc then createdAt asc —
    /// the exact scan order `MatchingService::reserve_agent_for_task` and
    /// the Scheduler's matching sweep require.
    async fn list_ready_to_match(&self) -> Result<Vec<Task>>;

    /// Current status of each id in `ids`, for dependency-gating checks.
    /// Ids with no matching task are simply absent from the result.
    async fn dependency_statuses(&self, ids: &[TaskId]) -> Result<HashMap<TaskId, TaskStatus>>;

    /// task id -> its declared dependencies, for cycle detection at enqueue.
    async fn dependency_graph(&self) -> Result<HashMap<TaskId, Vec<TaskId>>>;

    /// Atomically: validates `task.status ∈ {QUEUED, APPROVED_QUEUED}`, no
    /// existing pending ack, and all dependencies terminal-successful; then
    /// transitions to PENDING_ACK (resp. APPROVED_PENDING_ACK), sets
    /// `to.agentId`, inserts a PendingAck row, removes `agent_id` from the
    /// waiting set, appends history, and publishes `task:updated`.
    /// Returns `StateConflict` if any precondition no longer holds.
    async fn reserve_task(&self, task_id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<Task>;

    /// Atomically: validates `status ∈ {PENDING_ACK, APPROVED_PENDING_ACK}`
    /// and matching `agent_id`; transitions to ASSIGNED; removes the
    /// PendingAck row; marks unread user messages read and returns them.
    async fn ack_task(
        &self,
        task_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Task, Vec<TaskMessage>)>;

    /// Atomically: validates non-terminal status and matching `agent_id`;
    /// appends `message` to the thread, touches `lastProgressAt`, marks
    /// unread user messages read and returns them.
    async fn record_progress(
        &self,
        task_id: &str,
        agent_id: &str,
        message: TaskMessage,
        now: DateTime<Utc>,
    ) -> Result<(Task, Vec<TaskMessage>)>;

    /// The generic transition primitive: validates `task.status ∈ expected`,
    /// applies `mutation`, appends exactly one history entry, sets
    /// `completedAt` iff the resulting status is terminal, and publishes
    /// `task:updated` (or `task:deleted` is never used — cancellation is a
    /// soft transition, not a deletion).
    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        mutation: TaskMutation,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    /// PendingAck rows older than `older_than`.
    async fn list_stale_pending_acks(&self, older_than: DateTime<Utc>) -> Result<Vec<PendingAck>>;

    /// Tasks in {ASSIGNED, IN_PROGRESS} whose `lastProgressAt` predates
    /// `older_than`.
    async fn list_stale_progress(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>>;

    // ---- Messages -------------------------------------------------------

    async fn append_message(&self, message: TaskMessage) -> Result<TaskMessage>;
    async fn list_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>>;
    async fn unread_user_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>>;
    async fn mark_messages_read(&self, ids: &[MessageId]) -> Result<()>;

    // ---- Agents -----------------------------------------------------------

    async fn upsert_agent(&self, agent: NewAgent, now: DateTime<Utc>) -> Result<Agent>;
    async fn get_agent(&self, id: &str) -> Result<Agent>;
    async fn find_agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn list_agents(&self) -> Result<Vec<Agent>>;
    async fn touch_heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Derived per §3.3: PROCESSING if the agent owns ≥1 non-terminal task
    /// in {ASSIGNED, IN_PROGRESS, PENDING_ACK}; WAITING if present in the
    /// waiting set; OFFLINE otherwise.
    async fn agent_status(&self, agent_id: &str) -> Result<AgentStatus>;

    // ---- Waiting set ----------------------------------------------------

    async fn enter_waiting_set(&self, waiting: WaitingAgent) -> Result<()>;
    /// Returns `true` if a row was present and removed.
    async fn remove_from_waiting_set(&self, agent_id: &str) -> Result<bool>;
    async fn list_waiting_agents(&self) -> Result<Vec<WaitingAgent>>;
    async fn stale_waiting_agents(&self, older_than: DateTime<Utc>) -> Result<Vec<WaitingAgent>>;

    // ---- Evictions & system prompts -------------------------------------

    async fn queue_eviction(&self, eviction: Eviction) -> Result<()>;
    async fn pop_eviction(&self, agent_id: &str) -> Result<Option<Eviction>>;

    async fn queue_system_prompt(&self, prompt: SystemPrompt) -> Result<()>;
    /// Pops the highest-priority prompt addressed to `agent_id` directly, to
    /// one of `capabilities`, or broadcast — in that precedence order.
    async fn pop_system_prompt(
        &self,
        agent_id: &str,
        capabilities: &HashSet<String>,
    ) -> Result<Option<SystemPrompt>>;

    // ---- Events -----------------------------------------------------------

    /// Allocates the next monotonic seq and persists `{seq, kind, payload}`
    /// within the same transaction as the state write that caused it, then
    /// returns the stored event for broadcast.
    async fn append_event(
        &self,
        kind: EventKind,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Event>;
    async fn list_events_since(&self, seq: i64) -> Result<Vec<Event>>;
    async fn max_event_seq(&self) -> Result<i64>;

    // ---- Review comments & logs (peripheral persisted tables) -----------

    async fn add_review_comment(&self, comment: ReviewComment) -> Result<ReviewComment>;
    async fn list_review_comments(&self, task_id: &str) -> Result<Vec<ReviewComment>>;
    async fn append_log(&self, level: &str, target: &str, message: &str, now: DateTime<Utc>) -> Result<()>;

    // ---- Aggregate --------------------------------------------------------

    async fn stats(&self) -> Result<StoreStats>;
    async fn health_check(&self) -> Result<()>;

    /// Invoked once at startup (§5): resets every PENDING_ACK/
    /// APPROVED_PENDING_ACK task back to QUEUED/APPROVED_QUEUED, clears the
    /// waiting set and all pending-ack rows, since every agent must
    /// re-establish its poll session after a restart.
    async fn recover_from_restart(&self, now: DateTime<Utc>) -> Result<()>;
}

/// Helper exposed for MatchingService/Lifecycle: whether `agent` satisfies
/// `task`'s workspace routing constraint, per §4.3 rule 2.
pub fn workspace_matches(task_workspace_id: Option<&str>, agent_workspace: Option<&WorkspaceContext>) -> bool {
    match task_workspace_id {
        Some(required) => agent_workspace
            .and_then(|w| w.repo_id.as_deref())
            .map(|repo_id| repo_id == required)
            .unwrap_or(false),
        None => true,
    }
}
