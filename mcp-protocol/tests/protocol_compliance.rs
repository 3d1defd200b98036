//! Structural compliance tests for the tool RPC surface (§6.1, §7): every
//! dispatched operation returns either a JSON payload or the structured
//! `{"error": {"kind", "message"}}` shape, never an unstructured failure.

mod common;

use broker_protocol::error::json_error_response;
use broker_protocol::handler::dispatch;
use serde_json::json;

#[tokio::test]
async fn unknown_operation_is_a_validation_error() {
    let ctx = common::context().await;
    let err = dispatch(&ctx, "frobnicate", json!({})).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn malformed_params_are_a_validation_error_not_a_panic() {
    let ctx = common::context().await;
    // register_agent requires `id` and `displayName`; neither is present.
    let err = dispatch(&ctx, "register_agent", json!({ "nonsense": true })).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn register_agent_response_has_the_expected_shape() {
    let ctx = common::context().await;
    let result = dispatch(
        &ctx,
        "register_agent",
        json!({ "id": "agent-1", "displayName": "Agent One", "capabilities": ["rust"] }),
    )
    .await
    .expect("register_agent should succeed");

    assert_eq!(result["id"], "agent-1");
    assert_eq!(result["displayName"], "Agent One");
}

#[tokio::test]
async fn errors_map_onto_structured_http_bodies() {
    let error = broker_core::error::BrokerError::task_not_found("missing-task");
    let response = json_error_response(error);
    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);

    let body = http_body_util::BodyExt::collect(response.into_body()).await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(value["error"]["kind"].is_string());
    assert!(value["error"]["message"].is_string());
}

#[tokio::test]
async fn get_task_context_on_a_missing_task_is_not_found() {
    let ctx = common::context().await;
    let err = dispatch(&ctx, "get_task_context", json!({ "taskId": "does-not-exist" })).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn broadcast_system_prompt_requires_a_target() {
    let ctx = common::context().await;
    let err = dispatch(
        &ctx,
        "broadcast_system_prompt",
        json!({ "promptType": "reminder", "message": "keep context in workspace" }),
    )
    .await
    .unwrap_err();
    assert!(err.is_validation());
}
