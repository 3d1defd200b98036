//! Maps [`BrokerError`] onto the structured HTTP error shape shared by
//! the admin surface and the tool RPC surface (§7): every failure is a
//! JSON body with a semantic `kind` and a `message`, with the HTTP
//! status `BrokerError::status_code()` already prescribes. Nothing here
//! propagates as an unstructured crash to the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use broker_core::error::BrokerError;
use serde_json::json;

pub fn json_error_response(error: BrokerError) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let response = json_error_response(BrokerError::task_not_found("T1"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn blocked_maps_to_451() {
        let response = json_error_response(BrokerError::Blocked("disallowed content".to_string()));
        assert_eq!(response.status(), StatusCode::from_u16(451).unwrap());
    }
}
