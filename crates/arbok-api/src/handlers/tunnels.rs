//! Admin API: tunnel CRUD.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use arbok_core::humantime::format_duration;
use arbok_registry::Tunnel;

use crate::error::{ApiError, Result};
use crate::state::ApiState;

/// Tunnel shape in admin responses. Never carries the private key.
#[derive(Debug, Serialize)]
pub struct TunnelResponse {
    pub id: String,
    pub subdomain: String,
    pub url: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl: String,
}

impl TunnelResponse {
    pub fn from_tunnel(tunnel: &Tunnel, domain: &str) -> Self {
        Self {
            id: tunnel.id.clone(),
            subdomain: tunnel.subdomain.clone(),
            url: format!("https://{}.{}", tunnel.subdomain, domain),
            port: tunnel.port,
            created_at: tunnel.created_at,
            expires_at: tunnel.expires_at,
            ttl: format_duration(tunnel.ttl()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TunnelListResponse {
    pub tunnels: Vec<TunnelResponse>,
    pub count: usize,
}

/// Parse and range-check a port path segment.
pub fn parse_port(value: &str) -> Result<u16> {
    let port: u32 = value.parse().map_err(|_| ApiError::InvalidPort)?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(ApiError::InvalidPort);
    }
    Ok(port as u16)
}

/// `POST /api/tunnel/{port}`
pub async fn create_tunnel(
    State(state): State<ApiState>,
    Path(port): Path<String>,
) -> Result<impl IntoResponse> {
    let port = parse_port(&port)?;
    let tunnel = state.registry.create(port).await?;
    Ok((
        StatusCode::CREATED,
        Json(TunnelResponse::from_tunnel(&tunnel, &state.cfg.domain)),
    ))
}

/// `GET /api/tunnel/{id}`
pub async fn get_tunnel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelResponse>> {
    let tunnel = state.registry.get(&id).ok_or(ApiError::TunnelNotFound)?;
    Ok(Json(TunnelResponse::from_tunnel(&tunnel, &state.cfg.domain)))
}

/// `DELETE /api/tunnel/{id}`
pub async fn delete_tunnel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.registry.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/tunnels`
pub async fn list_tunnels(State(state): State<ApiState>) -> Json<TunnelListResponse> {
    let tunnels: Vec<TunnelResponse> = state
        .registry
        .list()
        .iter()
        .map(|t| TunnelResponse::from_tunnel(t, &state.cfg.domain))
        .collect();
    let count = tunnels.len();
    Json(TunnelListResponse { tunnels, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_parsing_boundaries() {
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("abc").is_err());
        assert!(parse_port("-1").is_err());
        assert!(parse_port("").is_err());
        assert_eq!(parse_port("1").unwrap(), 1);
        assert_eq!(parse_port("3000").unwrap(), 3000);
        assert_eq!(parse_port("65535").unwrap(), 65535);
    }
}
