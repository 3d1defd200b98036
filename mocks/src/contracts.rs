//! Contract tests any `Store` implementation should pass, so both
//! `MockStore` and `broker-store-sqlite`'s `SqliteStore` can be run through
//! the same suite and stay behaviorally identical.

use crate::fixtures::create_new_task;
use broker_core::models::{NewAgent, TaskStatus};
use broker_core::store::Store;
use chrono::Utc;

/// Runs every contract test below against `store`.
pub async fn test_store_contract<S: Store>(store: &S) {
    test_insert_and_get_contract(store).await;
    test_reserve_requires_queued_status_contract(store).await;
    test_reserve_ack_contract(store).await;
    test_waiting_set_contract(store).await;
    test_agent_status_contract(store).await;
}

pub async fn test_insert_and_get_contract<S: Store>(store: &S) {
    let task = create_new_task().into_task(Utc::now());
    let inserted = store.insert_task(task.clone()).await.expect("insert should succeed");
    assert_eq!(inserted.id, task.id);

    let fetched = store.get_task(&task.id).await.expect("get should succeed");
    assert_eq!(fetched.id, task.id);
    assert_eq!(fetched.status, TaskStatus::Queued);

    let missing = store.find_task("does-not-exist").await.expect("find should not error");
    assert!(missing.is_none());
}

pub async fn test_reserve_requires_queued_status_contract<S: Store>(store: &S) {
    let mut task = create_new_task().into_task(Utc::now());
    task.status = TaskStatus::Completed;
    store.insert_task(task.clone()).await.expect("insert should succeed");

    let result = store.reserve_task(&task.id, "agent-1", Utc::now()).await;
    assert!(result.is_err(), "reserving a completed task should fail");
}

pub async fn test_reserve_ack_contract<S: Store>(store: &S) {
    let task = create_new_task().into_task(Utc::now());
    store.insert_task(task.clone()).await.expect("insert should succeed");

    let reserved = store
        .reserve_task(&task.id, "agent-1", Utc::now())
        .await
        .expect("reserve should succeed");
    assert_eq!(reserved.status, TaskStatus::PendingAck);
    assert_eq!(reserved.to.agent_id.as_deref(), Some("agent-1"));

    // A second agent reserving the same task must be rejected: it's no
    // longer in a queued-like status.
    let conflict = store.reserve_task(&task.id, "agent-2", Utc::now()).await;
    assert!(conflict.is_err(), "double reservation should be rejected");

    let (acked, _unread) = store
        .ack_task(&task.id, "agent-1", Utc::now())
        .await
        .expect("ack should succeed");
    assert_eq!(acked.status, TaskStatus::Assigned);

    // Wrong agent acking should be rejected.
    let reserved2 = create_new_task().into_task(Utc::now());
    store.insert_task(reserved2.clone()).await.expect("insert should succeed");
    store
        .reserve_task(&reserved2.id, "agent-1", Utc::now())
        .await
        .expect("reserve should succeed");
    let wrong_agent = store.ack_task(&reserved2.id, "agent-2", Utc::now()).await;
    assert!(wrong_agent.is_err(), "ack from the wrong agent should be rejected");
}

pub async fn test_waiting_set_contract<S: Store>(store: &S) {
    let waiting = broker_core::models::WaitingAgent {
        agent_id: "agent-1".to_string(),
        capabilities: Default::default(),
        workspace_context: None,
        entered_at: Utc::now(),
    };
    store.enter_waiting_set(waiting).await.expect("enter should succeed");

    let all = store.list_waiting_agents().await.expect("list should succeed");
    assert!(all.iter().any(|w| w.agent_id == "agent-1"));

    let removed = store.remove_from_waiting_set("agent-1").await.expect("remove should succeed");
    assert!(removed);
    let removed_again = store.remove_from_waiting_set("agent-1").await.expect("remove should succeed");
    assert!(!removed_again);
}

pub async fn test_agent_status_contract<S: Store>(store: &S) {
    store
        .upsert_agent(NewAgent { id: "agent-1".to_string(), display_name: "A".to_string(), role: None, capabilities: vec![], workspace_context: None, source: "test".to_string() }, Utc::now())
        .await
        .expect("upsert should succeed");

    let status = store.agent_status("agent-1").await.expect("status should succeed");
    assert_eq!(status, broker_core::models::AgentStatus::Offline);

    let waiting = broker_core::models::WaitingAgent {
        agent_id: "agent-1".to_string(),
        capabilities: Default::default(),
        workspace_context: None,
        entered_at: Utc::now(),
    };
    store.enter_waiting_set(waiting).await.expect("enter should succeed");
    let status = store.agent_status("agent-1").await.expect("status should succeed");
    assert_eq!(status, broker_core::models::AgentStatus::Waiting);
}
