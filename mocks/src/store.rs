//! An in-memory `Store` implementation for tests: no SQLite, no I/O, just a
//! `parking_lot::Mutex`-guarded set of maps that reproduce the same
//! preconditions and ordering guarantees as `broker-store-sqlite`.
//!
//! Carries the same error-injection and call-history idioms as the crate's
//! old repository mock, generalized to the full `Store` trait.

use async_trait::async_trait;
use broker_core::error::{BrokerError, Result};
use broker_core::models::{
    Agent, AgentId, AgentStatus, Event, EventKind, Eviction, MessageId, NewAgent, PendingAck,
    ReviewComment, SystemPrompt, SystemPromptTarget, Task, TaskFilter, TaskId, TaskMessage,
    TaskStatus,
};
use broker_core::store::{Patch, Store, StoreStats, TaskMutation};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    messages: HashMap<TaskId, Vec<TaskMessage>>,
    agents: HashMap<AgentId, Agent>,
    waiting: HashMap<AgentId, broker_core::models::WaitingAgent>,
    pending_acks: HashMap<TaskId, PendingAck>,
    evictions: HashMap<AgentId, Vec<Eviction>>,
    system_prompts: Vec<SystemPrompt>,
    events: Vec<Event>,
    review_comments: HashMap<TaskId, Vec<ReviewComment>>,
    log_count: u64,
}

/// In-memory `Store` for unit and integration tests.
///
/// Use `inject_error` to force the next calls to fail (until `clear_error`),
/// and `call_history`/`assert_called` to verify which operations a caller
/// actually exercised.
pub struct MockStore {
    inner: Mutex<Inner>,
    error_injection: Mutex<Option<BrokerError>>,
    call_history: Mutex<Vec<String>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            error_injection: Mutex::new(None),
            call_history: Mutex::new(Vec::new()),
        }
    }

    /// Seed with a fixed set of tasks, as if they had already been enqueued.
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        let mut inner = store.inner.lock();
        for task in tasks {
            inner.tasks.insert(task.id.clone(), task);
        }
        drop(inner);
        store
    }

    /// Every subsequent call returns `error` until `clear_error` is called.
    pub fn inject_error(&self, error: BrokerError) {
        *self.error_injection.lock() = Some(error);
    }

    pub fn clear_error(&self) {
        *self.error_injection.lock() = None;
    }

    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.call_history.lock().clear();
    }

    pub fn assert_called(&self, method: &str) {
        let history = self.call_history.lock();
        assert!(
            history.iter().any(|m| m == method),
            "expected '{method}' to have been called, history was: {history:?}"
        );
    }

    fn record(&self, method: &str) {
        self.call_history.lock().push(method.to_string());
    }

    fn check_injected(&self) -> Result<()> {
        match self.error_injection.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Store for MockStore {
    async fn insert_task(&self, task: Task) -> Result<Task> {
        self.record("insert_task");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        self.record("get_task");
        self.check_injected()?;
        self.inner
            .lock()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::task_not_found(id))
    }

    async fn find_task(&self, id: &str) -> Result<Option<Task>> {
        self.record("find_task");
        self.check_injected()?;
        Ok(self.inner.lock().tasks.get(id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.record("list_tasks");
        self.check_injected()?;
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| match &filter.status {
                Some(statuses) => statuses.contains(&t.status),
                None => true,
            })
            .filter(|t| match filter.active {
                Some(true) => !t.status.is_terminal(),
                Some(false) => t.status.is_terminal(),
                None => true,
            })
            .filter(|t| match &filter.q {
                Some(q) => t.prompt.contains(q.as_str())
                    || t.title.as_deref().is_some_and(|title| title.contains(q.as_str())),
                None => true,
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        let offset = filter.offset.unwrap_or(0) as usize;
        let tasks = tasks.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => tasks.take(limit as usize).collect(),
            None => tasks.collect(),
        })
    }

    async fn list_ready_to_match(&self) -> Result<Vec<Task>> {
        self.record("list_ready_to_match");
        self.check_injected()?;
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status.is_queued_like())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            priority_rank(a.priority)
                .cmp(&priority_rank(b.priority))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn dependency_statuses(&self, ids: &[TaskId]) -> Result<HashMap<TaskId, TaskStatus>> {
        self.record("dependency_statuses");
        self.check_injected()?;
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.tasks.get(id).map(|t| (id.clone(), t.status)))
            .collect())
    }

    async fn dependency_graph(&self) -> Result<HashMap<TaskId, Vec<TaskId>>> {
        self.record("dependency_graph");
        self.check_injected()?;
        Ok(self
            .inner
            .lock()
            .tasks
            .values()
            .map(|t| (t.id.clone(), t.dependencies.clone()))
            .collect())
    }

    async fn reserve_task(&self, task_id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<Task> {
        self.record("reserve_task");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        let dep_statuses: HashMap<TaskId, TaskStatus> = {
            let task = inner
                .tasks
                .get(task_id)
                .ok_or_else(|| BrokerError::task_not_found(task_id))?;
            task.dependencies
                .iter()
                .filter_map(|id| inner.tasks.get(id).map(|t| (id.clone(), t.status)))
                .collect()
        };

        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::task_not_found(task_id))?;

        if !task.status.is_queued_like() || inner.pending_acks.contains_key(task_id) {
            return Err(BrokerError::precondition_drifted(task_id));
        }
        let deps_satisfied = task
            .dependencies
            .iter()
            .all(|id| dep_statuses.get(id).is_some_and(|s| s.is_terminal_success()));
        if !deps_satisfied {
            return Err(BrokerError::precondition_drifted(task_id));
        }

        let new_status = if task.status == TaskStatus::Queued {
            TaskStatus::PendingAck
        } else {
            TaskStatus::ApprovedPendingAck
        };
        task.status = new_status;
        task.to.agent_id = Some(agent_id.to_string());
        task.history.push(broker_core::models::TaskHistoryEntry {
            timestamp: now,
            status: new_status,
            agent_id: Some(agent_id.to_string()),
            message: None,
        });
        let task = task.clone();

        inner.pending_acks.insert(
            task_id.to_string(),
            PendingAck { task_id: task_id.to_string(), agent_id: agent_id.to_string(), sent_at: now },
        );
        inner.waiting.remove(agent_id);

        Ok(task)
    }

    async fn ack_task(
        &self,
        task_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Task, Vec<TaskMessage>)> {
        self.record("ack_task");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::task_not_found(task_id))?;

        if !task.status.is_pending_ack_like() || task.to.agent_id.as_deref() != Some(agent_id) {
            return Err(BrokerError::precondition_drifted(task_id));
        }
        task.status = TaskStatus::Assigned;
        task.history.push(broker_core::models::TaskHistoryEntry {
            timestamp: now,
            status: TaskStatus::Assigned,
            agent_id: Some(agent_id.to_string()),
            message: None,
        });
        let task = task.clone();
        inner.pending_acks.remove(task_id);

        let unread = unread_and_mark(&mut inner.messages, task_id);
        Ok((task, unread))
    }

    async fn record_progress(
        &self,
        task_id: &str,
        agent_id: &str,
        message: TaskMessage,
        now: DateTime<Utc>,
    ) -> Result<(Task, Vec<TaskMessage>)> {
        self.record("record_progress");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        {
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| BrokerError::task_not_found(task_id))?;
            if task.status.is_terminal() || task.to.agent_id.as_deref() != Some(agent_id) {
                return Err(BrokerError::precondition_drifted(task_id));
            }
            task.last_progress_at = now;
        }
        inner.messages.entry(task_id.to_string()).or_default().push(message);
        let unread = unread_and_mark(&mut inner.messages, task_id);
        let task = inner.tasks.get(task_id).cloned().expect("task present");
        Ok((task, unread))
    }

    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        mutation: TaskMutation,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        self.record("transition_task");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::task_not_found(task_id))?;

        if !expected.contains(&task.status) {
            return Err(BrokerError::precondition_drifted(task_id));
        }

        let new_status = mutation.new_status.unwrap_or(task.status);
        task.status = new_status;
        if let Patch::Set(agent_id) = mutation.set_agent_id {
            task.to.agent_id = agent_id;
        }
        if let Patch::Set(response) = mutation.response {
            task.response = response;
        }
        if let Patch::Set(workspace_id) = mutation.workspace_id {
            task.to.workspace_id = workspace_id;
        }
        if let Some(caps) = mutation.required_capabilities {
            task.to.required_capabilities = caps;
        }
        task.history.push(broker_core::models::TaskHistoryEntry {
            timestamp: now,
            status: new_status,
            agent_id: task.to.agent_id.clone(),
            message: mutation.history_message,
        });
        if new_status.is_terminal() {
            task.completed_at = Some(now);
        }
        let task = task.clone();

        if let Some(message) = mutation.append_message {
            inner.messages.entry(task_id.to_string()).or_default().push(message);
        }
        if mutation.clear_pending_ack {
            inner.pending_acks.remove(task_id);
        }

        Ok(task)
    }

    async fn list_stale_pending_acks(&self, older_than: DateTime<Utc>) -> Result<Vec<PendingAck>> {
        self.record("list_stale_pending_acks");
        self.check_injected()?;
        Ok(self
            .inner
            .lock()
            .pending_acks
            .values()
            .filter(|p| p.sent_at < older_than)
            .cloned()
            .collect())
    }

    async fn list_stale_progress(&self, older_than: DateTime<Utc>) -> Result<Vec<Task>> {
        self.record("list_stale_progress");
        self.check_injected()?;
        Ok(self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
            .filter(|t| t.last_progress_at < older_than)
            .cloned()
            .collect())
    }

    async fn append_message(&self, message: TaskMessage) -> Result<TaskMessage> {
        self.record("append_message");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        inner.messages.entry(message.task_id.clone()).or_default().push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        self.record("list_messages");
        self.check_injected()?;
        Ok(self.inner.lock().messages.get(task_id).cloned().unwrap_or_default())
    }

    async fn unread_user_messages(&self, task_id: &str) -> Result<Vec<TaskMessage>> {
        self.record("unread_user_messages");
        self.check_injected()?;
        Ok(self
            .inner
            .lock()
            .messages
            .get(task_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.role == broker_core::models::MessageRole::User && !m.is_read)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_messages_read(&self, ids: &[MessageId]) -> Result<()> {
        self.record("mark_messages_read");
        self.check_injected()?;
        let id_set: HashSet<&MessageId> = ids.iter().collect();
        let mut inner = self.inner.lock();
        for messages in inner.messages.values_mut() {
            for m in messages.iter_mut() {
                if id_set.contains(&m.id) {
                    m.is_read = true;
                }
            }
        }
        Ok(())
    }

    async fn upsert_agent(&self, agent: NewAgent, now: DateTime<Utc>) -> Result<Agent> {
        self.record("upsert_agent");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        let record = Agent {
            id: agent.id.clone(),
            display_name: agent.display_name,
            role: agent.role,
            capabilities: agent.capabilities.into_iter().collect(),
            workspace_context: agent.workspace_context,
            last_seen: now,
            source: agent.source,
        };
        inner.agents.insert(agent.id, record.clone());
        Ok(record)
    }

    async fn get_agent(&self, id: &str) -> Result<Agent> {
        self.record("get_agent");
        self.check_injected()?;
        self.inner
            .lock()
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::agent_not_found(id))
    }

    async fn find_agent(&self, id: &str) -> Result<Option<Agent>> {
        self.record("find_agent");
        self.check_injected()?;
        Ok(self.inner.lock().agents.get(id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.record("list_agents");
        self.check_injected()?;
        Ok(self.inner.lock().agents.values().cloned().collect())
    }

    async fn touch_heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.record("touch_heartbeat");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| BrokerError::agent_not_found(agent_id))?;
        agent.last_seen = now;
        Ok(())
    }

    async fn agent_status(&self, agent_id: &str) -> Result<AgentStatus> {
        self.record("agent_status");
        self.check_injected()?;
        let inner = self.inner.lock();
        if inner.waiting.contains_key(agent_id) {
            return Ok(AgentStatus::Waiting);
        }
        let processing = inner.tasks.values().any(|t| {
            t.to.agent_id.as_deref() == Some(agent_id)
                && matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::PendingAck)
        });
        Ok(if processing { AgentStatus::Processing } else { AgentStatus::Offline })
    }

    async fn enter_waiting_set(&self, waiting: broker_core::models::WaitingAgent) -> Result<()> {
        self.record("enter_waiting_set");
        self.check_injected()?;
        self.inner.lock().waiting.insert(waiting.agent_id.clone(), waiting);
        Ok(())
    }

    async fn remove_from_waiting_set(&self, agent_id: &str) -> Result<bool> {
        self.record("remove_from_waiting_set");
        self.check_injected()?;
        Ok(self.inner.lock().waiting.remove(agent_id).is_some())
    }

    async fn list_waiting_agents(&self) -> Result<Vec<broker_core::models::WaitingAgent>> {
        self.record("list_waiting_agents");
        self.check_injected()?;
        let mut waiting: Vec<_> = self.inner.lock().waiting.values().cloned().collect();
        waiting.sort_by_key(|w| w.entered_at);
        Ok(waiting)
    }

    async fn stale_waiting_agents(&self, older_than: DateTime<Utc>) -> Result<Vec<broker_core::models::WaitingAgent>> {
        self.record("stale_waiting_agents");
        self.check_injected()?;
        Ok(self
            .inner
            .lock()
            .waiting
            .values()
            .filter(|w| w.entered_at < older_than)
            .cloned()
            .collect())
    }

    async fn queue_eviction(&self, eviction: Eviction) -> Result<()> {
        self.record("queue_eviction");
        self.check_injected()?;
        self.inner
            .lock()
            .evictions
            .entry(eviction.agent_id.clone())
            .or_default()
            .push(eviction);
        Ok(())
    }

    async fn pop_eviction(&self, agent_id: &str) -> Result<Option<Eviction>> {
        self.record("pop_eviction");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        match inner.evictions.get_mut(agent_id) {
            Some(list) if !list.is_empty() => Ok(Some(list.remove(0))),
            _ => Ok(None),
        }
    }

    async fn queue_system_prompt(&self, prompt: SystemPrompt) -> Result<()> {
        self.record("queue_system_prompt");
        self.check_injected()?;
        self.inner.lock().system_prompts.push(prompt);
        Ok(())
    }

    async fn pop_system_prompt(&self, agent_id: &str, capabilities: &HashSet<String>) -> Result<Option<SystemPrompt>> {
        self.record("pop_system_prompt");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        let mut candidates: Vec<usize> = (0..inner.system_prompts.len()).collect();
        candidates.sort_by(|&a, &b| {
            let pa = &inner.system_prompts[a];
            let pb = &inner.system_prompts[b];
            pb.priority.cmp(&pa.priority).then(pa.created_at.cmp(&pb.created_at))
        });

        let pick = |pred: &dyn Fn(&SystemPrompt) -> bool| {
            candidates.iter().copied().find(|&i| pred(&inner.system_prompts[i]))
        };

        let index = pick(&|p| matches!(&p.target, SystemPromptTarget::Agent { agent_id: a } if a == agent_id))
            .or_else(|| pick(&|p| matches!(&p.target, SystemPromptTarget::Capability { capability } if capabilities.contains(capability))))
            .or_else(|| pick(&|p| matches!(p.target, SystemPromptTarget::Broadcast)));

        Ok(index.map(|i| inner.system_prompts.remove(i)))
    }

    async fn append_event(&self, kind: EventKind, payload: serde_json::Value, now: DateTime<Utc>) -> Result<Event> {
        self.record("append_event");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        let seq = inner.events.len() as i64 + 1;
        let event = Event { seq, kind, payload, at: now };
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn list_events_since(&self, seq: i64) -> Result<Vec<Event>> {
        self.record("list_events_since");
        self.check_injected()?;
        Ok(self.inner.lock().events.iter().filter(|e| e.seq > seq).cloned().collect())
    }

    async fn max_event_seq(&self) -> Result<i64> {
        self.record("max_event_seq");
        self.check_injected()?;
        Ok(self.inner.lock().events.last().map(|e| e.seq).unwrap_or(0))
    }

    async fn add_review_comment(&self, comment: ReviewComment) -> Result<ReviewComment> {
        self.record("add_review_comment");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        inner.review_comments.entry(comment.task_id.clone()).or_default().push(comment.clone());
        Ok(comment)
    }

    async fn list_review_comments(&self, task_id: &str) -> Result<Vec<ReviewComment>> {
        self.record("list_review_comments");
        self.check_injected()?;
        Ok(self.inner.lock().review_comments.get(task_id).cloned().unwrap_or_default())
    }

    async fn append_log(&self, _level: &str, _target: &str, _message: &str, _now: DateTime<Utc>) -> Result<()> {
        self.record("append_log");
        self.check_injected()?;
        self.inner.lock().log_count += 1;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.record("stats");
        self.check_injected()?;
        let inner = self.inner.lock();
        let mut tasks_by_status: HashMap<TaskStatus, u64> = HashMap::new();
        let mut tasks_by_agent: HashMap<AgentId, u64> = HashMap::new();
        for task in inner.tasks.values() {
            *tasks_by_status.entry(task.status).or_default() += 1;
            if let Some(agent_id) = &task.to.agent_id {
                *tasks_by_agent.entry(agent_id.clone()).or_default() += 1;
            }
        }
        Ok(StoreStats {
            total_tasks: inner.tasks.len() as u64,
            tasks_by_status,
            tasks_by_agent,
            waiting_agents: inner.waiting.len() as u64,
            pending_acks: inner.pending_acks.len() as u64,
            max_event_seq: inner.events.last().map(|e| e.seq).unwrap_or(0),
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.record("health_check");
        self.check_injected()
    }

    async fn recover_from_restart(&self, now: DateTime<Utc>) -> Result<()> {
        self.record("recover_from_restart");
        self.check_injected()?;
        let mut inner = self.inner.lock();
        for task in inner.tasks.values_mut() {
            let reset_to = match task.status {
                TaskStatus::PendingAck => Some(TaskStatus::Queued),
                TaskStatus::ApprovedPendingAck => Some(TaskStatus::ApprovedQueued),
                _ => None,
            };
            if let Some(new_status) = reset_to {
                task.status = new_status;
                task.to.agent_id = None;
                task.history.push(broker_core::models::TaskHistoryEntry {
                    timestamp: now,
                    status: new_status,
                    agent_id: None,
                    message: Some("restart recovery: reservation reset".to_string()),
                });
            }
        }
        inner.waiting.clear();
        inner.pending_acks.clear();
        Ok(())
    }
}

fn priority_rank(priority: broker_core::models::Priority) -> u8 {
    use broker_core::models::Priority::*;
    match priority {
        Critical => 0,
        High => 1,
        Normal => 2,
    }
}

fn unread_and_mark(messages: &mut HashMap<TaskId, Vec<TaskMessage>>, task_id: &str) -> Vec<TaskMessage> {
    let Some(thread) = messages.get_mut(task_id) else { return Vec::new() };
    let unread: Vec<TaskMessage> = thread
        .iter()
        .filter(|m| m.role == broker_core::models::MessageRole::User && !m.is_read)
        .cloned()
        .collect();
    for m in thread.iter_mut() {
        if m.role == broker_core::models::MessageRole::User {
            m.is_read = true;
        }
    }
    unread
}
