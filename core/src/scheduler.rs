//! `Scheduler` (§2 component F, §4.5): the periodic + event-driven
//! reconciliation loop. Four sweeps run every pass, in this order: ack
//! reaping, progress reaping, matching, stale-waiter cleanup. The loop
//! wakes on whichever comes first of its tick interval or `Lifecycle`'s
//! `scheduler_wake` signal, so an enqueue with an already-waiting agent
//! doesn't have to wait out a full tick (§9).

use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::matching::MatchingService;
use crate::store::Store;
use chrono::Duration as ChronoDuration;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The four scheduler timeouts, all configurable (SPEC_FULL §10.3) rather
/// than hardcoded constants.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// How often the loop wakes even with no `scheduler_wake` signal.
    pub tick_interval: Duration,
    /// T_ACK: how long a reservation may sit unacknowledged.
    pub ack_timeout: Duration,
    /// T_HEARTBEAT: how long an assigned/in-progress task may go without
    /// a progress report before it's considered dead.
    pub heartbeat_timeout: Duration,
    /// T_STALE_WAIT: how long a waiting-set row may sit without being
    /// claimed or refreshed before it's treated as an orphaned poll.
    pub stale_wait_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5 * 60),
            stale_wait_timeout: Duration::from_secs(2 * 30),
        }
    }
}

pub struct Scheduler<S: Store> {
    lifecycle: Arc<Lifecycle<S>>,
    config: SchedulerConfig,
}

impl<S: Store + 'static> Scheduler<S> {
    pub fn new(lifecycle: Arc<Lifecycle<S>>, config: SchedulerConfig) -> Self {
        Self { lifecycle, config }
    }

    /// Runs until `shutdown` is set to `true`. Intended to be spawned as its
    /// own task at server startup.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.lifecycle.scheduler_wake().notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
            if let Err(e) = self.reconcile().await {
                tracing::error!(error = %e, "scheduler reconciliation pass failed");
            }
        }
    }

    /// One full pass of all four sweeps. Exposed directly for tests that
    /// want deterministic control over when reconciliation runs.
    pub async fn reconcile(&self) -> Result<()> {
        self.reap_stale_acks().await?;
        self.reap_stale_progress().await?;
        self.run_matching_sweep().await?;
        self.sweep_stale_waiters().await?;
        Ok(())
    }

    async fn reap_stale_acks(&self) -> Result<()> {
        let store = self.lifecycle.store();
        let threshold = Utc::now() - to_chrono(self.config.ack_timeout);
        for pending in store.list_stale_pending_acks(threshold).await? {
            match self.lifecycle.requeue_expired_ack(&pending.task_id).await {
                Ok(_) => {}
                Err(e) if e.is_state_conflict() || e.is_not_found() => {
                    // already acked or otherwise moved on since the scan; fine.
                }
                Err(e) => tracing::warn!(error = %e, task_id = %pending.task_id, "ack-timeout requeue failed"),
            }
        }
        Ok(())
    }

    async fn reap_stale_progress(&self) -> Result<()> {
        let store = self.lifecycle.store();
        let threshold = Utc::now() - to_chrono(self.config.heartbeat_timeout);
        for task in store.list_stale_progress(threshold).await? {
            match self.lifecycle.fail_stale_progress(&task.id, "heartbeat timeout: no progress reported").await {
                Ok(_) => {}
                Err(e) if e.is_state_conflict() || e.is_not_found() => {}
                Err(e) => tracing::warn!(error = %e, task_id = %task.id, "heartbeat-timeout failure transition failed"),
            }
        }
        Ok(())
    }

    /// QUEUED ∪ APPROVED_QUEUED tasks, in priority/FIFO order, matched
    /// against currently waiting agents.
    async fn run_matching_sweep(&self) -> Result<()> {
        let store = self.lifecycle.store();
        let ready = store.list_ready_to_match().await?;
        if ready.is_empty() {
            return Ok(());
        }
        let all_deps: Vec<String> = ready.iter().flat_map(|t| t.dependencies.clone()).collect();
        let statuses = store.dependency_statuses(&all_deps).await?;
        let mut waiting = store.list_waiting_agents().await?;

        for task in &ready {
            if waiting.is_empty() {
                break;
            }
            if !MatchingService::dependencies_satisfied(task, &statuses) {
                continue;
            }
            let Some(agent_id) = MatchingService::reserve_agent_for_task(task, &waiting).map(|w| w.agent_id.clone())
            else {
                continue;
            };
            match self.lifecycle.dispatch_to_waiting_agent(task, &agent_id).await {
                Ok(_) => waiting.retain(|w| w.agent_id != agent_id),
                Err(e) if e.is_state_conflict() => {
                    // task or agent claimed elsewhere between the scan and
                    // this dispatch; leave both candidates for the next pass.
                }
                Err(e) => tracing::warn!(error = %e, task_id = %task.id, agent_id = %agent_id, "matching dispatch failed"),
            }
        }
        Ok(())
    }

    /// Removes waiting-set rows abandoned longer than `T_STALE_WAIT`
    /// without cleanup (e.g. a crashed agent process whose `Poller` never
    /// got to run its cancellation cleanup).
    async fn sweep_stale_waiters(&self) -> Result<()> {
        let store = self.lifecycle.store();
        let threshold = Utc::now() - to_chrono(self.config.stale_wait_timeout);
        for waiting in store.stale_waiting_agents(threshold).await? {
            store.remove_from_waiting_set(&waiting.agent_id).await?;
        }
        Ok(())
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        assert_eq!(config.stale_wait_timeout, Duration::from_secs(60));
    }
}
