//! Shared-secret authentication for the broker's admin and tool-RPC
//! surfaces.
//!
//! A single secret, presented as a header or a query parameter, checked
//! against one value resolved once at startup (environment override, or
//! generated and persisted on first run — see `broker-server`'s config
//! layer). Disabled mode admits every request, for local development.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use tracing::warn;

pub const SECRET_HEADER: &str = "x-broker-secret";
pub const SECRET_QUERY_PARAM: &str = "secret";

/// Shared-secret authenticator.
#[derive(Clone)]
pub struct BrokerAuth {
    enabled: bool,
    secret: String,
}

impl BrokerAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { enabled: true, secret: secret.into() }
    }

    /// Development mode: every request is admitted regardless of secret.
    pub fn disabled() -> Self {
        Self { enabled: false, secret: String::new() }
    }

    fn presented(headers: &HeaderMap, uri: &Uri) -> Option<String> {
        if let Some(value) = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) {
            return Some(value.to_string());
        }
        secret_from_query(uri)
    }

    pub fn check(&self, headers: &HeaderMap, uri: &Uri) -> bool {
        if !self.enabled {
            return true;
        }
        match Self::presented(headers, uri) {
            Some(value) => value == self.secret,
            None => {
                warn!("request missing broker secret");
                false
            }
        }
    }
}

fn secret_from_query(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next()?;
        (key == SECRET_QUERY_PARAM).then(|| value.to_string())
    })
}

/// `axum::middleware::from_fn_with_state` entry point; rejects with 401
/// before the request reaches any handler when the secret doesn't match.
pub async fn require_secret(
    State(auth): State<BrokerAuth>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if auth.check(request.headers(), request.uri()) {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn disabled_auth_allows_all() {
        let auth = BrokerAuth::disabled();
        let headers = HeaderMap::new();
        let uri: Uri = "/stats".parse().unwrap();
        assert!(auth.check(&headers, &uri));
    }

    #[test]
    fn missing_secret_is_rejected() {
        let auth = BrokerAuth::new("correct-horse");
        let headers = HeaderMap::new();
        let uri: Uri = "/stats".parse().unwrap();
        assert!(!auth.check(&headers, &uri));
    }

    #[test]
    fn header_secret_is_accepted() {
        let auth = BrokerAuth::new("correct-horse");
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, HeaderValue::from_static("correct-horse"));
        let uri: Uri = "/stats".parse().unwrap();
        assert!(auth.check(&headers, &uri));
    }

    #[test]
    fn wrong_header_secret_is_rejected() {
        let auth = BrokerAuth::new("correct-horse");
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, HeaderValue::from_static("wrong"));
        let uri: Uri = "/stats".parse().unwrap();
        assert!(!auth.check(&headers, &uri));
    }

    #[test]
    fn query_secret_is_accepted() {
        let auth = BrokerAuth::new("correct-horse");
        let headers = HeaderMap::new();
        let uri: Uri = "/events?sinceSeq=0&secret=correct-horse".parse().unwrap();
        assert!(auth.check(&headers, &uri));
    }
}
