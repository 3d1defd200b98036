//! `AgentRegistry` (§2 component B): registration, heartbeat, and eviction
//! signaling for known agents. Matching/reservation is `MatchingService`'s
//! job; this module only owns agent identity and status bookkeeping.

use crate::error::Result;
use crate::models::{Agent, AgentStatus, Event, EventKind, Eviction, NewAgent};
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;

pub struct AgentRegistry<S: Store> {
    store: Arc<S>,
}

impl<S: Store> AgentRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Upsert an agent's identity/capability/workspace metadata and touch
    /// its heartbeat. Returns an `agent:status` event for the caller to
    /// publish on the `EventBus` once the registration transaction commits.
    pub async fn register(&self, new_agent: NewAgent) -> Result<(Agent, Event)> {
        let now = Utc::now();
        let agent = self.store.upsert_agent(new_agent, now).await?;
        let event = self
            .store
            .append_event(EventKind::AgentStatus, agent_status_payload(&agent, AgentStatus::Offline), now)
            .await?;
        Ok((agent, event))
    }

    pub async fn get(&self, agent_id: &str) -> Result<Agent> {
        self.store.get_agent(agent_id).await
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        self.store.list_agents().await
    }

    pub async fn status(&self, agent_id: &str) -> Result<AgentStatus> {
        self.store.agent_status(agent_id).await
    }

    pub async fn touch_heartbeat(&self, agent_id: &str) -> Result<()> {
        self.store.touch_heartbeat(agent_id, Utc::now()).await
    }

    /// Queues a forced-disconnect signal; the agent's next
    /// `wait_for_task` call (or its current one, via the Poller) observes
    /// and consumes it instead of being handed a task.
    pub async fn evict(&self, agent_id: &str, reason: &str) -> Result<Event> {
        let now = Utc::now();
        self.store
            .queue_eviction(Eviction {
                agent_id: agent_id.to_string(),
                reason: reason.to_string(),
                created_at: now,
            })
            .await?;
        let agent = self.store.get_agent(agent_id).await?;
        self.store
            .append_event(EventKind::AgentStatus, agent_status_payload(&agent, AgentStatus::Offline), now)
            .await
    }
}

fn agent_status_payload(agent: &Agent, status: AgentStatus) -> serde_json::Value {
    serde_json::json!({
        "agentId": agent.id,
        "displayName": agent.display_name,
        "status": status,
    })
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end against `SqliteStore`/the in-memory mock Store in
    // the `broker-store-sqlite` and `broker-mocks` crates, which are the
    // only `Store` implementations available to this crate's own tests.
}
