//! `Poller` (§4.4): long-poll delivery and its cancellation/timeout
//! semantics. Waiters are woken by `Notifier`, a per-agent/per-task
//! registry of `tokio::sync::Notify` handles backed by the concurrency
//! runtime, as spec §9's "async long-poll" design note calls for.

use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::models::{AgentId, PollOutcome, Task, TaskId, WorkspaceContext};
use crate::store::Store;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-agent and per-task wake primitives. Shared between `Lifecycle`
/// (which notifies on reservation/completion) and `Poller` (which waits).
#[derive(Default)]
pub struct Notifier {
    agent_wakers: Mutex<HashMap<AgentId, Arc<Notify>>>,
    task_completions: Mutex<HashMap<TaskId, Arc<Notify>>>,
    /// A task handed to an agent by a process other than that agent's own
    /// `wait_for_task` call (the Scheduler's matching sweep) has nowhere to
    /// return it through — it is stashed here and picked up when the waker
    /// fires.
    deliveries: Mutex<HashMap<AgentId, Task>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn waker_for_agent(&self, agent_id: &str) -> Arc<Notify> {
        let mut map = self.agent_wakers.lock().unwrap();
        map.entry(agent_id.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    /// Wakes whatever is waiting for this agent — a reservation, an
    /// eviction, or a new system prompt all use this same channel; the
    /// waiter re-checks all three on wake (see `Poller::wait_for_task`).
    pub fn notify_agent(&self, agent_id: &str) {
        if let Some(w) = self.agent_wakers.lock().unwrap().get(agent_id) {
            w.notify_one();
        }
    }

    fn completion_waker(&self, task_id: &str) -> Arc<Notify> {
        let mut map = self.task_completions.lock().unwrap();
        map.entry(task_id.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    pub fn notify_completion(&self, task_id: &str) {
        if let Some(w) = self.task_completions.lock().unwrap().get(task_id) {
            w.notify_waiters();
        }
    }

    pub fn stash_delivery(&self, agent_id: &str, task: Task) {
        self.deliveries.lock().unwrap().insert(agent_id.to_string(), task);
    }

    pub fn take_delivery(&self, agent_id: &str) -> Option<Task> {
        self.deliveries.lock().unwrap().remove(agent_id)
    }
}

/// Removes an agent's waiting-set row if the poll is abandoned
/// (disconnect, cancellation) before normal completion clears it. Runs the
/// cleanup on a detached task since `Drop` cannot `.await`.
struct WaitingGuard<S: Store> {
    store: Arc<S>,
    agent_id: AgentId,
    armed: bool,
}

impl<S: Store + 'static> Drop for WaitingGuard<S> {
    fn drop(&mut self) {
        if self.armed {
            let store = self.store.clone();
            let agent_id = self.agent_id.clone();
            tokio::spawn(async move {
                let _ = store.remove_from_waiting_set(&agent_id).await;
            });
        }
    }
}

pub struct Poller<S: Store> {
    lifecycle: Arc<Lifecycle<S>>,
    notifier: Arc<Notifier>,
}

impl<S: Store + 'static> Poller<S> {
    pub fn new(lifecycle: Arc<Lifecycle<S>>, notifier: Arc<Notifier>) -> Self {
        Self { lifecycle, notifier }
    }

    /// `waitForTask` (§4.4). `timeout` is the caller-supplied deadline
    /// (bounded by the server's configured maximum, enforced by the
    /// transport layer, not here).
    pub async fn wait_for_task(
        &self,
        agent_id: &str,
        capabilities: HashSet<String>,
        workspace: Option<WorkspaceContext>,
        timeout: Duration,
    ) -> Result<PollOutcome> {
        let store = self.lifecycle.store();
        let now = chrono::Utc::now();

        // 1. heartbeat
        store.touch_heartbeat(agent_id, now).await?;

        // 2. pending eviction
        if let Some(eviction) = store.pop_eviction(agent_id).await? {
            return Ok(PollOutcome::Eviction { reason: eviction.reason });
        }

        // 3. pending system prompt
        if let Some(prompt) = store.pop_system_prompt(agent_id, &capabilities).await? {
            return Ok(PollOutcome::SystemPrompt(Box::new(prompt)));
        }

        // 4. synchronous match attempt
        if let Some(task) = self
            .lifecycle
            .try_reserve_for_waiting_agent(agent_id, &capabilities, workspace.as_ref())
            .await?
        {
            return Ok(PollOutcome::Task(Box::new(task)));
        }

        // 5. enter the waiting set and block on the earliest of: a
        // reservation, an eviction, a new system prompt, or the timeout.
        store
            .enter_waiting_set(crate::models::WaitingAgent {
                agent_id: agent_id.to_string(),
                capabilities: capabilities.clone(),
                workspace_context: workspace.clone(),
                entered_at: now,
            })
            .await?;
        let mut guard = WaitingGuard {
            store: store.clone(),
            agent_id: agent_id.to_string(),
            armed: true,
        };
        let waker = self.notifier.waker_for_agent(agent_id);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                store.remove_from_waiting_set(agent_id).await?;
                guard.armed = false;
                return Ok(PollOutcome::Idle);
            }
            tokio::select! {
                _ = waker.notified() => {
                    // 6. on wake, re-check everything in priority order.
                    if let Some(eviction) = store.pop_eviction(agent_id).await? {
                        store.remove_from_waiting_set(agent_id).await?;
                        guard.armed = false;
                        return Ok(PollOutcome::Eviction { reason: eviction.reason });
                    }
                    if let Some(prompt) = store.pop_system_prompt(agent_id, &capabilities).await? {
                        store.remove_from_waiting_set(agent_id).await?;
                        guard.armed = false;
                        return Ok(PollOutcome::SystemPrompt(Box::new(prompt)));
                    }
                    if let Some(task) = self.lifecycle.reserved_task_for_agent(agent_id) {
                        store.remove_from_waiting_set(agent_id).await?;
                        guard.armed = false;
                        return Ok(PollOutcome::Task(Box::new(task)));
                    }
                    // spurious wake: loop and keep waiting out the remaining budget.
                }
                _ = tokio::time::sleep(remaining) => {
                    store.remove_from_waiting_set(agent_id).await?;
                    guard.armed = false;
                    return Ok(PollOutcome::Idle);
                }
            }
        }
    }

    /// `waitForCompletion` (§4.4): resolves when `task_id` enters a
    /// terminal state, or `None` on timeout.
    pub async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<crate::models::Task>> {
        let store = self.lifecycle.store();
        let task = store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(Some(task));
        }
        let waker = self.notifier.completion_waker(task_id);
        tokio::select! {
            _ = waker.notified() => Ok(Some(store.get_task(task_id).await?)),
            _ = tokio::time::sleep(timeout) => Ok(None),
        }
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }
}
