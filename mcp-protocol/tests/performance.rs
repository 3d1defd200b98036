//! Dispatch-latency budget tests: tool RPC operations that don't park on
//! a long-poll must resolve quickly even against a real SQLite-backed
//! store, since every agent round-trip pays this cost.

mod common;

use broker_core::models::{NewTask, TaskOrigin, TaskRouting};
use broker_protocol::handler::dispatch;
use serde_json::json;
use std::time::{Duration, Instant};

const BUDGET: Duration = Duration::from_millis(250);

#[tokio::test]
async fn register_agent_is_fast() {
    let ctx = common::context().await;
    let started = Instant::now();
    dispatch(&ctx, "register_agent", json!({ "id": "A1", "displayName": "Agent One" })).await.expect("register");
    assert!(started.elapsed() < BUDGET, "register_agent took {:?}, over budget", started.elapsed());
}

#[tokio::test]
async fn enqueue_and_immediate_reservation_round_trip_is_fast() {
    let ctx = common::context().await;
    dispatch(&ctx, "register_agent", json!({ "id": "A1", "displayName": "Agent One", "capabilities": ["code"] }))
        .await
        .expect("register");

    let started = Instant::now();
    ctx.lifecycle
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
        .expect("enqueue");
    let outcome = dispatch(&ctx, "wait_for_task", json!({ "agentId": "A1", "capabilities": ["code"], "timeoutSec": 5 }))
        .await
        .expect("wait_for_task");
    assert_eq!(outcome["outcome"], "task");
    assert!(started.elapsed() < BUDGET, "enqueue+reserve took {:?}, over budget", started.elapsed());
}

#[tokio::test]
async fn one_hundred_sequential_dispatches_stay_within_budget() {
    let ctx = common::context().await;
    dispatch(&ctx, "register_agent", json!({ "id": "A1", "displayName": "Agent One" })).await.expect("register");

    let started = Instant::now();
    for i in 0..100 {
        dispatch(
            &ctx,
            "update_progress",
            json!({ "taskId": format!("missing-{i}"), "agentId": "A1", "message": "x" }),
        )
        .await
        .expect_err("unknown task should fail fast, not hang");
    }
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(5), "100 failing dispatches took {elapsed:?}, suspiciously slow");
}
