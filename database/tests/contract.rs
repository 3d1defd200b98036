//! Contract tests that any [`Store`] implementation must pass.
//!
//! These exercise the trait surface directly rather than `SqliteStore`
//! internals, so a future second backend can run the same suite.

use broker_core::models::{
    NewAgent, NewTask, Priority, Task, TaskFilter, TaskOrigin, TaskRouting, TaskStatus,
    WaitingAgent,
};
use broker_core::store::Store;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

#[allow(dead_code)]
pub async fn test_store_contract<S: Store + 'static>(store: Arc<S>) {
    test_health_check(store.clone()).await;
    test_insert_and_get(store.clone()).await;
    test_find_missing_returns_none(store.clone()).await;
    test_list_tasks_filters_by_status(store.clone()).await;
    test_reserve_ack_cycle(store.clone()).await;
    test_reserve_rejects_wrong_status(store.clone()).await;
    test_transition_task_enforces_expected_status(store.clone()).await;
    test_messages_round_trip(store.clone()).await;
    test_waiting_set_fifo_order(store.clone()).await;
    test_agents_upsert(store.clone()).await;
    test_events_monotonic_seq(store.clone()).await;
    test_stats_aggregate(store.clone()).await;
}

fn new_task(id: &str) -> Task {
    NewTask {
        id: Some(id.to_string()),
        prompt: format!("prompt for {id}"),
        title: None,
        from: TaskOrigin::Human { id: "u1".to_string() },
        to: TaskRouting::default(),
        priority: Priority::Normal,
        context: serde_json::json!({}),
        dependencies: vec![],
    }
    .into_task(Utc::now())
}

async fn test_health_check<S: Store>(store: Arc<S>) {
    assert!(store.health_check().await.is_ok());
}

async fn test_insert_and_get<S: Store>(store: Arc<S>) {
    let task = store.insert_task(new_task("contract-insert")).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let fetched = store.get_task("contract-insert").await.unwrap();
    assert_eq!(fetched.id, task.id);
}

async fn test_find_missing_returns_none<S: Store>(store: Arc<S>) {
    assert!(store.find_task("no-such-task").await.unwrap().is_none());
    assert!(store.get_task("no-such-task").await.is_err());
}

async fn test_list_tasks_filters_by_status<S: Store>(store: Arc<S>) {
    store.insert_task(new_task("contract-filter-a")).await.unwrap();
    let mut done = new_task("contract-filter-b");
    done.status = TaskStatus::Completed;
    store.insert_task(done).await.unwrap();

    let queued = store
        .list_tasks(&TaskFilter { status: Some(vec![TaskStatus::Queued]), ..Default::default() })
        .await
        .unwrap();
    assert!(queued.iter().any(|t| t.id == "contract-filter-a"));
    assert!(!queued.iter().any(|t| t.id == "contract-filter-b"));
}

async fn test_reserve_ack_cycle<S: Store>(store: Arc<S>) {
    store.insert_task(new_task("contract-reserve")).await.unwrap();

    let reserved = store.reserve_task("contract-reserve", "agent-1", Utc::now()).await.unwrap();
    assert_eq!(reserved.status, TaskStatus::PendingAck);
    assert_eq!(reserved.to.agent_id.as_deref(), Some("agent-1"));

    let (acked, messages) = store.ack_task("contract-reserve", "agent-1", Utc::now()).await.unwrap();
    assert_eq!(acked.status, TaskStatus::Assigned);
    assert!(messages.is_empty());
}

async fn test_reserve_rejects_wrong_status<S: Store>(store: Arc<S>) {
    let mut task = new_task("contract-reserve-bad");
    task.status = TaskStatus::InReview;
    store.insert_task(task).await.unwrap();

    let result = store.reserve_task("contract-reserve-bad", "agent-1", Utc::now()).await;
    assert!(result.is_err());
}

async fn test_transition_task_enforces_expected_status<S: Store>(store: Arc<S>) {
    use broker_core::store::TaskMutation;

    store.insert_task(new_task("contract-transition")).await.unwrap();

    let wrong_expectation = store
        .transition_task(
            "contract-transition",
            &[TaskStatus::InReview],
            TaskMutation { new_status: Some(TaskStatus::Cancelled), ..Default::default() },
            Utc::now(),
        )
        .await;
    assert!(wrong_expectation.is_err());

    let cancelled = store
        .transition_task(
            "contract-transition",
            &[TaskStatus::Queued],
            TaskMutation { new_status: Some(TaskStatus::Cancelled), ..Default::default() },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
}

async fn test_messages_round_trip<S: Store>(store: Arc<S>) {
    use broker_core::models::{MessageRole, MessageType, TaskMessage};

    store.insert_task(new_task("contract-messages")).await.unwrap();
    let message = TaskMessage {
        id: uuid::Uuid::new_v4().to_string(),
        task_id: "contract-messages".to_string(),
        timestamp: Utc::now(),
        role: MessageRole::User,
        content: "hello".to_string(),
        is_read: false,
        message_type: MessageType::Comment,
        reply_to: None,
        metadata: serde_json::json!({}),
        images: None,
    };
    store.append_message(message.clone()).await.unwrap();

    let unread = store.unread_user_messages("contract-messages").await.unwrap();
    assert_eq!(unread.len(), 1);

    store.mark_messages_read(&[message.id.clone()]).await.unwrap();
    assert!(store.unread_user_messages("contract-messages").await.unwrap().is_empty());
    assert_eq!(store.list_messages("contract-messages").await.unwrap().len(), 1);
}

async fn test_waiting_set_fifo_order<S: Store>(store: Arc<S>) {
    let base = Utc::now();
    store
        .enter_waiting_set(WaitingAgent {
            agent_id: "contract-wait-2".to_string(),
            capabilities: HashSet::new(),
            workspace_context: None,
            entered_at: base + chrono::Duration::seconds(1),
        })
        .await
        .unwrap();
    store
        .enter_waiting_set(WaitingAgent {
            agent_id: "contract-wait-1".to_string(),
            capabilities: HashSet::new(),
            workspace_context: None,
            entered_at: base,
        })
        .await
        .unwrap();

    let waiting = store.list_waiting_agents().await.unwrap();
    let ours: Vec<_> = waiting.iter().filter(|w| w.agent_id.starts_with("contract-wait")).collect();
    assert_eq!(ours[0].agent_id, "contract-wait-1");
    assert_eq!(ours[1].agent_id, "contract-wait-2");

    assert!(store.remove_from_waiting_set("contract-wait-1").await.unwrap());
    assert!(!store.remove_from_waiting_set("contract-wait-1").await.unwrap());
}

async fn test_agents_upsert<S: Store>(store: Arc<S>) {
    let agent = store
        .upsert_agent(
            NewAgent {
                id: "contract-agent".to_string(),
                display_name: "Agent".to_string(),
                role: None,
                capabilities: vec!["rust".to_string()],
                workspace_context: None,
                source: "test".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(agent.capabilities.contains("rust"));

    let updated = store
        .upsert_agent(
            NewAgent {
                id: "contract-agent".to_string(),
                display_name: "Agent Renamed".to_string(),
                role: None,
                capabilities: vec!["rust".to_string(), "python".to_string()],
                workspace_context: None,
                source: "test".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(updated.display_name, "Agent Renamed");
    assert_eq!(updated.capabilities.len(), 2);
}

async fn test_events_monotonic_seq<S: Store>(store: Arc<S>) {
    let before = store.max_event_seq().await.unwrap();
    let e1 = store
        .append_event(broker_core::models::EventKind::TaskCreated, serde_json::json!({"id": "x"}), Utc::now())
        .await
        .unwrap();
    let e2 = store
        .append_event(broker_core::models::EventKind::TaskUpdated, serde_json::json!({"id": "x"}), Utc::now())
        .await
        .unwrap();
    assert!(e2.seq > e1.seq);
    assert_eq!(store.max_event_seq().await.unwrap(), e2.seq);

    let since = store.list_events_since(before).await.unwrap();
    assert!(since.iter().any(|e| e.seq == e1.seq));
    assert!(since.iter().any(|e| e.seq == e2.seq));
}

async fn test_stats_aggregate<S: Store>(store: Arc<S>) {
    store.insert_task(new_task("contract-stats")).await.unwrap();
    let stats = store.stats().await.unwrap();
    assert!(stats.total_tasks >= 1);
    assert!(stats.tasks_by_status.get(&TaskStatus::Queued).copied().unwrap_or(0) >= 1);
}

#[tokio::test]
async fn sqlite_store_passes_contract() {
    let store = broker_store_sqlite::SqliteStore::new(":memory:contract_suite").await.unwrap();
    store.migrate().await.unwrap();
    test_store_contract(Arc::new(store)).await;
}
