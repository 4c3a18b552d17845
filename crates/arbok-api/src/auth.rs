//! API-key authentication for the admin surface.
//!
//! An empty key set means open mode; otherwise a request must present a
//! configured key via `X-API-Key`, `Authorization: Bearer`, or the
//! `api_key` query parameter, compared in constant time.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::header;
use subtle::ConstantTimeEq;
use tracing::warn;

use arbok_observability::metrics;

use crate::error::ApiError;
use crate::state::ApiState;

pub const API_KEY_HEADER: &str = "x-api-key";
const BEARER_PREFIX: &str = "Bearer ";

/// The configured key set.
#[derive(Debug, Default)]
pub struct AuthGate {
    keys: Vec<String>,
}

impl AuthGate {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys: keys.into_iter().filter(|k| !k.is_empty()).collect(),
        }
    }

    /// Open mode: no keys configured, everything is permitted.
    pub fn open(&self) -> bool {
        self.keys.is_empty()
    }

    /// Constant-time comparison against every configured key. The
    /// accumulator never short-circuits, so timing reveals neither which
    /// key matched nor how far a comparison got.
    pub fn verify(&self, candidate: &str) -> bool {
        let mut matched = 0u8;
        for key in &self.keys {
            matched |= key.as_bytes().ct_eq(candidate.as_bytes()).unwrap_u8();
        }
        matched != 0
    }
}

/// Pull the candidate key out of a request: header, then bearer token,
/// then query parameter.
pub fn extract_key<B>(req: &Request<B>) -> Option<String> {
    if let Some(key) = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }

    if let Some(auth) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix(BEARER_PREFIX) {
            return Some(token.to_string());
        }
    }

    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("api_key=")
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
    })
}

/// Middleware guarding the `/api` subrouter.
pub async fn require_api_key(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Response {
    if state.auth.open() {
        return next.run(req).await;
    }

    match extract_key(&req) {
        Some(key) if state.auth.verify(&key) => {
            metrics().auth_successes_total.inc();
            next.run(req).await
        }
        _ => {
            metrics().auth_failures_total.inc();
            warn!(path = %req.uri().path(), "rejected admin API request");
            ApiError::Unauthorized.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(builder: http::request::Builder) -> Request<Body> {
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn empty_key_set_is_open() {
        assert!(AuthGate::new(vec![]).open());
        assert!(AuthGate::new(vec!["".into()]).open());
        assert!(!AuthGate::new(vec!["abc".into()]).open());
    }

    #[test]
    fn verify_accepts_any_configured_key() {
        let gate = AuthGate::new(vec!["abc".into(), "longer-key".into()]);
        assert!(gate.verify("abc"));
        assert!(gate.verify("longer-key"));
        assert!(!gate.verify("abd"));
        assert!(!gate.verify("ab"));
        assert!(!gate.verify(""));
    }

    #[test]
    fn extraction_prefers_header_then_bearer_then_query() {
        let req = request(
            http::Request::builder()
                .uri("/api/tunnels?api_key=from-query")
                .header("x-api-key", "from-header")
                .header("authorization", "Bearer from-bearer"),
        );
        assert_eq!(extract_key(&req).as_deref(), Some("from-header"));

        let req = request(
            http::Request::builder()
                .uri("/api/tunnels?api_key=from-query")
                .header("authorization", "Bearer from-bearer"),
        );
        assert_eq!(extract_key(&req).as_deref(), Some("from-bearer"));

        let req = request(http::Request::builder().uri("/api/tunnels?other=1&api_key=from-query"));
        assert_eq!(extract_key(&req).as_deref(), Some("from-query"));

        let req = request(http::Request::builder().uri("/api/tunnels"));
        assert_eq!(extract_key(&req), None);
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let req = request(
            http::Request::builder()
                .uri("/api/tunnels")
                .header("authorization", "Basic dXNlcjpwYXNz"),
        );
        assert_eq!(extract_key(&req), None);
    }
}
