//! API error types and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use arbok_registry::RegistryError;

/// Errors surfaced by the HTTP front-end.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid port number")]
    InvalidPort,

    #[error("invalid host header")]
    InvalidHost,

    #[error("not found")]
    NotFound,

    #[error("tunnel not found")]
    TunnelNotFound,

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("failed to create tunnel")]
    TunnelCreateFailed(#[source] RegistryError),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error body: `{error, code?, details?}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str, Option<String>) {
        match self {
            ApiError::InvalidPort => (StatusCode::BAD_REQUEST, "INVALID_PORT", None),
            ApiError::InvalidHost => (StatusCode::BAD_REQUEST, "INVALID_HOST", None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            ApiError::TunnelNotFound => (StatusCode::NOT_FOUND, "TUNNEL_NOT_FOUND", None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None),
            ApiError::TunnelCreateFailed(source) => {
                let status = match source {
                    RegistryError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, "TUNNEL_CREATE_FAILED", Some(source.to_string()))
            }
            ApiError::BadGateway(reason) => {
                (StatusCode::BAD_GATEWAY, "BAD_GATEWAY", Some(reason.clone()))
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", None),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, details) = self.status_and_code();
        let body = ErrorBody {
            error: self.to_string(),
            code: Some(code.to_string()),
            details,
        };
        (status, Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => ApiError::TunnelNotFound,
            other => ApiError::TunnelCreateFailed(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_maps_to_503_with_create_failed_code() {
        let err = ApiError::TunnelCreateFailed(RegistryError::PoolExhausted);
        let (status, code, _) = err.status_and_code();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(code, "TUNNEL_CREATE_FAILED");
    }

    #[test]
    fn registry_not_found_becomes_tunnel_not_found() {
        let err: ApiError = RegistryError::NotFound("x".into()).into();
        assert!(matches!(err, ApiError::TunnelNotFound));
    }
}
