//! End-to-end scenarios not already covered by `broker-protocol`'s own
//! integration tests (which exercise S1/S2/S4/S5 through the RPC dispatch
//! table). These two need the scheduler actually ticking, or touch the
//! admin-only `reject` path that has no dedicated RPC tool operation.

mod common;

use broker_core::models::{NewAgent, NewTask, TaskOrigin, TaskResponse, TaskRouting, TaskStatus};
use broker_core::store::Store;
use serde_json::json;
use tokio::time::{sleep, Duration};

/// S3: a reservation that's never acked is back in QUEUED after T_ACK,
/// with a history tail recording the requeue and no lingering pending-ack
/// row.
#[tokio::test]
async fn ack_timeout_requeues_the_task() {
    let h = common::harness();

    let t3 = h
        .lifecycle
        .enqueue(NewTask {
            id: None,
            prompt: "build Y".to_string(),
            title: None,
            from: TaskOrigin::Human { id: "user-1".to_string() },
            to: TaskRouting { agent_id: None, required_capabilities: vec![], workspace_id: None },
            priority: Default::default(),
            context: json!({}),
            dependencies: vec![],
        })
        .await
        .expect("enqueue T3");

    h.registry
        .register(NewAgent { id: "A1".to_string(), display_name: "A1".to_string(), role: None, capabilities: vec![], workspace_context: None, source: "test".to_string() })
        .await
        .expect("register A1");

    let reserved = h.lifecycle.store().reserve_task(&t3.id, "A1", chrono::Utc::now()).await.expect("reserve T3");
    assert_eq!(reserved.status, TaskStatus::PendingAck);

    // A1 never acks. Wait past the harness's ack_timeout, then run one
    // reconciliation pass directly (deterministic, no background task).
    sleep(Duration::from_millis(30)).await;
    h.scheduler.reconcile().await.expect("reconcile");

    let after = h.lifecycle.store().get_task(&t3.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Queued);
    assert!(after.to.agent_id.is_none());
    assert!(h
        .lifecycle
        .store()
        .list_stale_pending_acks(chrono::Utc::now())
        .await
        .unwrap()
        .is_empty());
}

/// S6: an admin rejecting a task in IN_REVIEW appends a review_feedback
/// message, returns it to QUEUED, and clears its agent assignment.
#[tokio::test]
async fn reject_appends_feedback_and_requeues() {
    let h = common::harness();

    let t1 = h
        .lifecycle
        .enqueue(NewTask {
            id: None,
            prompt: "build X".to_string(),
            title: None,
            from: TaskOrigin::Human { id: "user-1".to_string() },
            to: TaskRouting { agent_id: None, required_capabilities: vec!["code".to_string()], workspace_id: None },
            priority: Default::default(),
            context: json!({}),
            dependencies: vec![],
        })
        .await
        .expect("enqueue T1");

    h.lifecycle.store().reserve_task(&t1.id, "A1", chrono::Utc::now()).await.expect("reserve");
    h.lifecycle.ack(&t1.id, "A1").await.expect("ack");
    h.lifecycle
        .send_response(
            &t1.id,
            "A1",
            TaskStatus::InReview,
            TaskResponse { diff: Some("…50 lines of diff…".to_string()), ..Default::default() },
        )
        .await
        .expect("send_response IN_REVIEW");

    let rejected = h.lifecycle.reject(&t1.id, "tests missing".to_string()).await.expect("reject T1");
    assert_eq!(rejected.status, TaskStatus::Queued);
    assert!(rejected.to.agent_id.is_none());

    let messages = h.lifecycle.store().list_messages(&t1.id).await.unwrap();
    assert!(
        messages
            .iter()
            .any(|m| m.message_type == broker_core::models::MessageType::ReviewFeedback && m.content == "tests missing"),
        "expected a review_feedback message, got: {messages:?}"
    );
}
