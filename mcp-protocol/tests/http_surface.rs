//! HTTP-level tests for the assembled router: shared-secret enforcement
//! (§6.2) and the admin surface's JSON shapes, driven over a real socket
//! rather than through in-process dispatch.

mod common;

use serde_json::json;

#[tokio::test]
async fn health_check_needs_no_secret() {
    let (base, _secret) = common::spawn_server().await;
    let response = reqwest::get(format!("{base}/health")).await.expect("GET /health");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn stats_without_a_secret_is_unauthorized() {
    let (base, _secret) = common::spawn_server().await;
    let response = reqwest::get(format!("{base}/stats")).await.expect("GET /stats");
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn stats_with_the_header_secret_succeeds() {
    let (base, secret) = common::spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base}/stats"))
        .header("x-broker-secret", secret)
        .send()
        .await
        .expect("GET /stats");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn stats_with_the_query_secret_succeeds() {
    let (base, secret) = common::spawn_server().await;
    let response = reqwest::get(format!("{base}/stats?secret={secret}")).await.expect("GET /stats");
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn enqueue_then_fetch_task_round_trips_through_the_admin_surface() {
    let (base, secret) = common::spawn_server().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .header("x-broker-secret", &secret)
        .json(&json!({ "prompt": "build X" }))
        .send()
        .await
        .expect("POST /tasks")
        .json()
        .await
        .expect("task body");
    let task_id = created["id"].as_str().expect("task has an id").to_string();

    let fetched: serde_json::Value = client
        .get(format!("{base}/tasks/{task_id}"))
        .header("x-broker-secret", &secret)
        .send()
        .await
        .expect("GET /tasks/:id")
        .json()
        .await
        .expect("task body");
    assert_eq!(fetched["id"], task_id);
    assert_eq!(fetched["prompt"], "build X");
}

#[tokio::test]
async fn rpc_call_for_an_unknown_operation_returns_a_structured_error() {
    let (base, secret) = common::spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/rpc"))
        .header("x-broker-secret", &secret)
        .json(&json!({ "op": "frobnicate", "params": {} }))
        .send()
        .await
        .expect("POST /rpc");
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.expect("error body");
    assert_eq!(body["error"]["kind"], "ValidationError");
}

#[tokio::test]
async fn rpc_register_agent_round_trips() {
    let (base, secret) = common::spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/rpc"))
        .header("x-broker-secret", &secret)
        .json(&json!({ "op": "register_agent", "params": { "id": "A1", "displayName": "Agent One" } }))
        .send()
        .await
        .expect("POST /rpc");
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.expect("rpc body");
    assert_eq!(body["ok"], true);
    assert_eq!(body["result"]["id"], "A1");
}
