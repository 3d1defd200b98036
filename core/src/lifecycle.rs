//! `Lifecycle` (§2 component D): the policy layer. Every externally
//! triggered state change — enqueue, reserve, ack, progress, review,
//! block/answer, cancel/retry, update — is one method here. Each method
//! validates preconditions, computes the full `TaskMutation` (or calls a
//! dedicated `Store` method for the three operations that need one), and
//! publishes the resulting event. The Store enforces atomicity; this layer
//! enforces meaning.

use crate::error::{BrokerError, Result};
use crate::eventbus::EventBus;
use crate::matching::MatchingService;
use crate::models::{
    EventKind, MessageRole, MessageType, NewTask, ReviewComment, SystemPrompt, SystemPromptTarget,
    Task, TaskMessage, TaskOrigin, TaskPatch, TaskResponse, TaskStatus,
};
use crate::poller::Notifier;
use crate::security::{PromptScanner, ScanVerdict};
use crate::store::{Patch, Store, TaskMutation};
use crate::validation::Validator;
use crate::capability_inference::CapabilityInferrer;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Notify;

/// Every status a task can be in before reaching a terminal state. Used as
/// the `expected` set for operations (`cancel`, `update`) that apply to any
/// in-flight task regardless of which specific non-terminal state it's in.
pub const NON_TERMINAL_STATUSES: [TaskStatus; 9] = [
    TaskStatus::Queued,
    TaskStatus::PendingAck,
    TaskStatus::Assigned,
    TaskStatus::InProgress,
    TaskStatus::InReview,
    TaskStatus::ApprovedQueued,
    TaskStatus::ApprovedPendingAck,
    TaskStatus::Blocked,
    TaskStatus::PendingRes,
];

/// States `send_response` may be called from. The spec text also names a
/// `REJECTED` source state here, but no such `TaskStatus` variant exists
/// anywhere in the state model (rejection returns a task to `QUEUED`); that
/// appears to be a naming artifact, so it is omitted here (see DESIGN.md).
const SEND_RESPONSE_SOURCES: [TaskStatus; 5] = [
    TaskStatus::Assigned,
    TaskStatus::InProgress,
    TaskStatus::InReview,
    TaskStatus::ApprovedQueued,
    TaskStatus::ApprovedPendingAck,
];

const BLOCK_SOURCES: [TaskStatus; 3] = [TaskStatus::Assigned, TaskStatus::InProgress, TaskStatus::InReview];

/// A task together with everything an agent or reviewer needs to act on it:
/// its thread, its dependencies' outputs, and any standing review comments.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskContext {
    pub task: Task,
    pub messages: Vec<TaskMessage>,
    pub dependency_outputs: Vec<Task>,
    pub review_comments: Vec<ReviewComment>,
}

pub struct Lifecycle<S: Store> {
    store: Arc<S>,
    events: Arc<EventBus>,
    notifier: Arc<Notifier>,
    scanner: Arc<dyn PromptScanner>,
    inferrer: Arc<dyn CapabilityInferrer>,
    /// Wakes the Scheduler's reconciliation loop promptly whenever a task
    /// becomes queued-like, instead of waiting out its periodic tick (§9:
    /// "an enqueue with waiting agents must deliver in ≤1 RTT").
    scheduler_wake: Arc<Notify>,
}

impl<S: Store> Lifecycle<S> {
    pub fn new(
        store: Arc<S>,
        events: Arc<EventBus>,
        notifier: Arc<Notifier>,
        scanner: Arc<dyn PromptScanner>,
        inferrer: Arc<dyn CapabilityInferrer>,
    ) -> Self {
        Self {
            store,
            events,
            notifier,
            scanner,
            inferrer,
            scheduler_wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn scheduler_wake(&self) -> &Arc<Notify> {
        &self.scheduler_wake
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    async fn publish_task_event(&self, kind: EventKind, task: &Task) -> Result<()> {
        let now = Utc::now();
        let payload = serde_json::json!({ "taskId": task.id, "status": task.status, "task": task });
        let event = self.store.append_event(kind, payload, now).await?;
        self.events.publish(event);
        Ok(())
    }

    /// Looks for a currently waiting agent this task could go to right now,
    /// and if one exists, reserves and delivers it. Best-effort: a race
    /// losing out to someone else's reservation is swallowed, since the
    /// Scheduler's periodic sweep will pick the task up regardless.
    async fn attempt_immediate_dispatch(&self, task: &Task) -> Result<()> {
        let waiting = self.store.list_waiting_agents().await?;
        if let Some(winner) = MatchingService::reserve_agent_for_task(task, &waiting) {
            let agent_id = winner.agent_id.clone();
            if let Err(e) = self.dispatch_to_waiting_agent(task, &agent_id).await {
                if !e.is_state_conflict() {
                    return Err(e);
                }
            }
        }
        self.scheduler_wake.notify_one();
        Ok(())
    }

    // ---- D: task submission --------------------------------------------

    /// `enqueue` (§4.2). Validates, scans, checks for a dependency cycle,
    /// infers capabilities when none were supplied, persists, and attempts
    /// an immediate hand-off to a waiting agent before falling back to the
    /// Scheduler's periodic sweep.
    pub async fn enqueue(&self, mut new_task: NewTask) -> Result<Task> {
        Validator::validate_new_task(&new_task)?;

        match self.scanner.scan(&new_task.prompt) {
            ScanVerdict::Block(reason) => return Err(BrokerError::Blocked(reason)),
            ScanVerdict::Allow => {}
        }

        if new_task.to.required_capabilities.is_empty() {
            let inferred = self.inferrer.infer(&new_task.prompt);
            if !inferred.is_empty() {
                new_task.to.required_capabilities = inferred;
            }
        }

        let id = new_task.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !new_task.dependencies.is_empty() {
            let graph = self.store.dependency_graph().await?;
            if Validator::detect_cycle(&id, &new_task.dependencies, &graph) {
                return Err(BrokerError::cyclic_dependencies(&id));
            }
        }
        new_task.id = Some(id);

        let now = Utc::now();
        let task = self.store.insert_task(new_task.into_task(now)).await?;
        self.publish_task_event(EventKind::TaskCreated, &task).await?;
        self.attempt_immediate_dispatch(&task).await?;
        Ok(task)
    }

    /// Delegation wrapper (§11): an agent submits a subtask on another
    /// agent's behalf. Stamps `from` with the delegating agent's identity
    /// and marks `context.isDelegation`, then enqueues normally.
    pub async fn assign_task(&self, delegating_agent_id: &str, mut new_task: NewTask) -> Result<Task> {
        let delegator = self.store.get_agent(delegating_agent_id).await?;
        new_task.from = TaskOrigin::Agent {
            id: delegator.id.clone(),
            name: delegator.display_name.clone(),
        };
        let mut context = if new_task.context.is_null() { serde_json::json!({}) } else { new_task.context };
        context["isDelegation"] = serde_json::json!(true);
        new_task.context = context;
        self.enqueue(new_task).await
    }

    // ---- E/F: reservation ----------------------------------------------

    /// The raw atomic reservation primitive, shared by the Poller's direct
    /// match attempt and the Scheduler's sweep. No delivery side effects —
    /// callers decide how the winning agent learns about it.
    async fn reserve(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let now = Utc::now();
        let task = self.store.reserve_task(task_id, agent_id, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        Ok(task)
    }

    /// Called by `Poller::wait_for_task` before it parks: looks for an
    /// eligible task right now and reserves it synchronously if found.
    pub async fn try_reserve_for_waiting_agent(
        &self,
        agent_id: &str,
        capabilities: &std::collections::HashSet<String>,
        workspace: Option<&crate::models::WorkspaceContext>,
    ) -> Result<Option<Task>> {
        let ready = self.store.list_ready_to_match().await?;
        let all_deps: Vec<String> = ready.iter().flat_map(|t| t.dependencies.clone()).collect();
        let statuses = self.store.dependency_statuses(&all_deps).await?;
        let candidate = MatchingService::reserve_task_for_agent(
            &agent_id.to_string(),
            capabilities,
            workspace,
            &ready,
            &statuses,
        );
        let Some(candidate) = candidate else { return Ok(None) };
        let task_id = candidate.id.clone();
        match self.reserve(&task_id, agent_id).await {
            Ok(task) => Ok(Some(task)),
            Err(e) if e.is_state_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Called by the Scheduler's matching sweep when it finds a parked
    /// waiting agent for `task`: reserves it, then stashes the result for
    /// that agent's `Poller::wait_for_task` call to pick up on wake.
    pub async fn dispatch_to_waiting_agent(&self, task: &Task, agent_id: &str) -> Result<Task> {
        let reserved = self.reserve(&task.id, agent_id).await?;
        self.notifier.stash_delivery(agent_id, reserved.clone());
        self.notifier.notify_agent(agent_id);
        Ok(reserved)
    }

    /// What `Poller::wait_for_task` picks up after waking on a reservation
    /// dispatched asynchronously while it was parked.
    pub fn reserved_task_for_agent(&self, agent_id: &str) -> Option<Task> {
        self.notifier.take_delivery(agent_id)
    }

    pub async fn ack(&self, task_id: &str, agent_id: &str) -> Result<(Task, Vec<TaskMessage>)> {
        let now = Utc::now();
        let (task, unread) = self.store.ack_task(task_id, agent_id, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        Ok((task, unread))
    }

    pub async fn progress(
        &self,
        task_id: &str,
        agent_id: &str,
        content: impl Into<String>,
    ) -> Result<(Task, Vec<TaskMessage>)> {
        let now = Utc::now();
        let message = TaskMessage::new(task_id.to_string(), MessageRole::Agent, content, MessageType::Progress, now);
        let (task, unread) = self.store.record_progress(task_id, agent_id, message, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        Ok((task, unread))
    }

    /// `sendResponse` (§4.2): an agent reports review-readiness or a
    /// terminal outcome. `target_status` must be a legal successor of the
    /// task's current status per the transition graph; entering
    /// `IN_REVIEW` for a code/test task additionally requires a non-trivial
    /// diff.
    pub async fn send_response(
        &self,
        task_id: &str,
        agent_id: &str,
        target_status: TaskStatus,
        response: TaskResponse,
    ) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        if task.to.agent_id.as_deref() != Some(agent_id) {
            return Err(BrokerError::not_acked(task_id));
        }
        if !SEND_RESPONSE_SOURCES.contains(&task.status) {
            return Err(BrokerError::not_acked(task_id));
        }
        if !task.status.can_transition_to(target_status) {
            return Err(BrokerError::invalid_transition(task.status, target_status));
        }
        if target_status == TaskStatus::InReview
            && task.to.required_capabilities.iter().any(|c| c == "code" || c == "test")
        {
            let diff_ok = response
                .diff
                .as_deref()
                .map(|d| d.trim().chars().count() >= 20)
                .unwrap_or(false);
            if !diff_ok {
                return Err(BrokerError::missing_diff(task_id));
            }
        }

        let now = Utc::now();
        let history_message = response.message.clone();
        let mutation = TaskMutation {
            new_status: Some(target_status),
            response: Patch::Set(Some(response)),
            history_message,
            ..Default::default()
        };
        let task = match self.store.transition_task(task_id, &SEND_RESPONSE_SOURCES, mutation, now).await {
            Ok(task) => task,
            // SEND_RESPONSE_SOURCES is the precondition named in the spec
            // text as this operation's failure mode, even though the Store
            // reports a generic race the same way `StateConflict` always is.
            Err(e) if e.is_state_conflict() => return Err(BrokerError::not_acked(task_id)),
            Err(e) => return Err(e),
        };
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        if task.status.is_terminal() {
            self.notifier.notify_completion(task_id);
        }
        Ok(task)
    }

    // ---- review / blocking / answering ----------------------------------

    pub async fn approve(&self, task_id: &str, comment: Option<String>) -> Result<Task> {
        let now = Utc::now();
        let mutation = TaskMutation {
            new_status: Some(TaskStatus::ApprovedQueued),
            history_message: comment,
            ..Default::default()
        };
        let task = self.store.transition_task(task_id, &[TaskStatus::InReview], mutation, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        self.attempt_immediate_dispatch(&task).await?;
        Ok(task)
    }

    pub async fn reject(&self, task_id: &str, reason: String) -> Result<Task> {
        let now = Utc::now();
        let mutation = TaskMutation {
            new_status: Some(TaskStatus::Queued),
            set_agent_id: Patch::Set(None),
            history_message: Some(reason.clone()),
            append_message: Some(TaskMessage::new(
                task_id.to_string(),
                MessageRole::System,
                reason,
                MessageType::ReviewFeedback,
                now,
            )),
            ..Default::default()
        };
        let task = self.store.transition_task(task_id, &[TaskStatus::InReview], mutation, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        self.attempt_immediate_dispatch(&task).await?;
        Ok(task)
    }

    pub async fn block(&self, task_id: &str, agent_id: &str, reason: String) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        if task.to.agent_id.as_deref() != Some(agent_id) {
            return Err(BrokerError::not_acked(task_id));
        }
        let now = Utc::now();
        let mutation = TaskMutation {
            new_status: Some(TaskStatus::Blocked),
            response: Patch::Set(Some(TaskResponse {
                blocked_reason: Some(reason.clone()),
                ..Default::default()
            })),
            history_message: Some(reason.clone()),
            append_message: Some(TaskMessage::new(
                task_id.to_string(),
                MessageRole::Agent,
                reason,
                MessageType::BlockEvent,
                now,
            )),
            ..Default::default()
        };
        let task = self.store.transition_task(task_id, &BLOCK_SOURCES, mutation, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        Ok(task)
    }

    /// `answer` (§4.2): a human (or delegating agent) responds to a
    /// blocked task, returning it to the queue for re-matching.
    pub async fn answer(&self, task_id: &str, content: String) -> Result<Task> {
        let now = Utc::now();
        let message = TaskMessage::new(task_id.to_string(), MessageRole::User, content, MessageType::Comment, now);
        let mutation = TaskMutation {
            new_status: Some(TaskStatus::Queued),
            append_message: Some(message),
            ..Default::default()
        };
        let task = self.store.transition_task(task_id, &[TaskStatus::Blocked], mutation, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        self.attempt_immediate_dispatch(&task).await?;
        Ok(task)
    }

    // ---- reaping (called by the Scheduler) -------------------------------

    /// Ack-timeout requeue (§4.5): a `PENDING_ACK`/`APPROVED_PENDING_ACK`
    /// task whose agent never acked within `T_ACK` goes back to
    /// `QUEUED`/`APPROVED_QUEUED` respectively, losing its assignment.
    pub async fn requeue_expired_ack(&self, task_id: &str) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        let (from, to) = match task.status {
            TaskStatus::PendingAck => (TaskStatus::PendingAck, TaskStatus::Queued),
            TaskStatus::ApprovedPendingAck => (TaskStatus::ApprovedPendingAck, TaskStatus::ApprovedQueued),
            other => return Err(BrokerError::invalid_transition(other, TaskStatus::Queued)),
        };
        let now = Utc::now();
        let mutation = TaskMutation {
            new_status: Some(to),
            set_agent_id: Patch::Set(None),
            history_message: Some("ack timeout: requeued".to_string()),
            clear_pending_ack: true,
            ..Default::default()
        };
        let task = self.store.transition_task(task_id, &[from], mutation, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        self.attempt_immediate_dispatch(&task).await?;
        Ok(task)
    }

    /// Heartbeat-timeout failure (§4.5): an `ASSIGNED`/`IN_PROGRESS` task
    /// whose agent hasn't reported progress within `T_HEARTBEAT` is
    /// considered dead and fails outright (no further retries here — an
    /// operator calls `retry` if the work should be resubmitted).
    pub async fn fail_stale_progress(&self, task_id: &str, reason: &str) -> Result<Task> {
        let now = Utc::now();
        let mutation = TaskMutation {
            new_status: Some(TaskStatus::Failed),
            history_message: Some(reason.to_string()),
            ..Default::default()
        };
        let task = self
            .store
            .transition_task(task_id, &[TaskStatus::Assigned, TaskStatus::InProgress], mutation, now)
            .await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        self.notifier.notify_completion(task_id);
        Ok(task)
    }

    // ---- administrative --------------------------------------------------

    pub async fn cancel(&self, task_id: &str, reason: Option<String>) -> Result<Task> {
        let now = Utc::now();
        let mutation = TaskMutation {
            new_status: Some(TaskStatus::Cancelled),
            history_message: reason,
            clear_pending_ack: true,
            ..Default::default()
        };
        let task = self.store.transition_task(task_id, &NON_TERMINAL_STATUSES, mutation, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        self.notifier.notify_completion(task_id);
        Ok(task)
    }

    /// `retry` (§11): admin re-submission of a `FAILED` task. Clears the
    /// previous agent assignment and response so it matches fresh.
    pub async fn retry(&self, task_id: &str) -> Result<Task> {
        let now = Utc::now();
        let mutation = TaskMutation {
            new_status: Some(TaskStatus::Queued),
            set_agent_id: Patch::Set(None),
            response: Patch::Set(None),
            history_message: Some("retried after failure".to_string()),
            ..Default::default()
        };
        let task = self.store.transition_task(task_id, &[TaskStatus::Failed], mutation, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        self.attempt_immediate_dispatch(&task).await?;
        Ok(task)
    }

    pub async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<Task> {
        if let Some(ref caps) = patch.required_capabilities {
            Validator::validate_capabilities(caps)?;
        }
        let now = Utc::now();
        let mutation = TaskMutation {
            workspace_id: patch.workspace_id.map(Patch::Set).unwrap_or(Patch::Keep),
            required_capabilities: patch.required_capabilities,
            ..Default::default()
        };
        let task = self.store.transition_task(task_id, &NON_TERMINAL_STATUSES, mutation, now).await?;
        self.publish_task_event(EventKind::TaskUpdated, &task).await?;
        Ok(task)
    }

    // ---- system prompts & context ----------------------------------------

    pub async fn broadcast_system_prompt(
        &self,
        target: SystemPromptTarget,
        prompt_type: String,
        message: String,
        payload: Option<serde_json::Value>,
        priority: i32,
    ) -> Result<()> {
        let now = Utc::now();
        let prompt = SystemPrompt {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.clone(),
            prompt_type,
            message,
            payload,
            priority,
            created_at: now,
        };
        self.store.queue_system_prompt(prompt).await?;
        match target {
            SystemPromptTarget::Agent { agent_id } => self.notifier.notify_agent(&agent_id),
            SystemPromptTarget::Capability { .. } | SystemPromptTarget::Broadcast => {
                for agent in self.store.list_agents().await? {
                    self.notifier.notify_agent(&agent.id);
                }
            }
        }
        Ok(())
    }

    pub async fn get_task_context(&self, task_id: &str) -> Result<TaskContext> {
        let task = self.store.get_task(task_id).await?;
        let messages = self.store.list_messages(task_id).await?;
        let mut dependency_outputs = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            if let Some(dep_task) = self.store.find_task(dep).await? {
                dependency_outputs.push(dep_task);
            }
        }
        let review_comments = self.store.list_review_comments(task_id).await?;
        Ok(TaskContext { task, messages, dependency_outputs, review_comments })
    }

    /// Invoked once at startup (§5): resets in-flight pending-ack tasks and
    /// broadcasts a `sync:full` so every subscriber knows to resync.
    pub async fn recover(&self) -> Result<()> {
        let now = Utc::now();
        self.store.recover_from_restart(now).await?;
        let seq = self.store.max_event_seq().await?;
        let event = self.store.append_event(EventKind::SyncFull, serde_json::json!({ "seq": seq }), now).await?;
        self.events.publish(event);
        Ok(())
    }
}
