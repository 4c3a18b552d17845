//! Fallback dispatch: everything not matched by an explicit route.
//!
//! The Host header decides the surface. The apex domain (or a bare,
//! dot-less host) only offers curl-style provisioning; any other host is
//! treated as a tunnel subdomain and proxied into the overlay.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
};
use hyper::upgrade::OnUpgrade;
use std::net::SocketAddr;
use tracing::{debug, warn};

use arbok_proxy::headers::{is_websocket_upgrade, strip_port};
use arbok_proxy::{proxy_http, proxy_websocket};
use arbok_registry::Tunnel;

use crate::error::ApiError;
use crate::handlers::tunnels::parse_port;
use crate::state::ApiState;

pub async fn dispatch(
    State(state): State<ApiState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let host = strip_port(host).to_ascii_lowercase();

    if host == state.cfg.domain || !host.contains('.') {
        return apex_request(&state, &host, req).await;
    }

    let subdomain = host.split('.').next().unwrap_or_default();
    if subdomain == state.cfg.reserved_label() {
        return ApiError::TunnelNotFound.into_response();
    }

    let Some(tunnel) = state.registry.get_by_subdomain(subdomain) else {
        debug!(subdomain, "no tunnel for subdomain");
        return ApiError::TunnelNotFound.into_response();
    };

    proxy_into_tunnel(state, tunnel, client, req).await
}

/// Requests addressed to the server itself: `GET /{port}` provisions a
/// tunnel; anything else is a 404 on the apex, or a 400 for a host that
/// is not even domain-shaped.
async fn apex_request(state: &ApiState, host: &str, req: Request) -> Response {
    let path = req.uri().path().to_string();
    if let Some(segment) = single_path_segment(&path) {
        if req.method() == Method::GET {
            return provision(state, segment).await;
        }
    }

    if host == state.cfg.domain {
        ApiError::NotFound.into_response()
    } else {
        ApiError::InvalidHost.into_response()
    }
}

/// `GET /{port}`: create a tunnel and hand back its WireGuard config.
async fn provision(state: &ApiState, port_segment: &str) -> Response {
    let port = match parse_port(port_segment) {
        Ok(port) => port,
        Err(e) => return e.into_response(),
    };

    let tunnel = match state.registry.create(port).await {
        Ok(tunnel) => tunnel,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let body = render_client_config(
        &tunnel,
        state.device.public_key(),
        &state.device.server_ip().to_string(),
        &state.cfg.endpoint,
        &state.cfg.domain,
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.conf\"", tunnel.subdomain),
            ),
        ],
        body,
    )
        .into_response()
}

async fn proxy_into_tunnel(
    state: ApiState,
    tunnel: Tunnel,
    client: SocketAddr,
    mut req: Request,
) -> Response {
    if is_websocket_upgrade(&req) {
        if let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() {
            let registry = state.registry.clone();
            let id = tunnel.id.clone();
            let result = proxy_websocket(
                &state.device,
                tunnel.allowed_ip,
                tunnel.port,
                req,
                on_upgrade,
                move |sent, received| registry.update_traffic(&id, sent, received),
            )
            .await;
            return match result {
                Ok(response) => response.into_response(),
                Err(e) => {
                    warn!(error = %e, subdomain = %tunnel.subdomain, "websocket proxy failed");
                    ApiError::BadGateway(e.to_string()).into_response()
                }
            };
        }
    }

    match proxy_http(&state.device, tunnel.allowed_ip, tunnel.port, client.ip(), req).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            warn!(error = %e, subdomain = %tunnel.subdomain, "proxy failed");
            ApiError::BadGateway(e.to_string()).into_response()
        }
    }
}

/// The path's single segment, if it has exactly one.
fn single_path_segment(path: &str) -> Option<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() || trimmed.contains('/') {
        return None;
    }
    Some(trimmed)
}

/// Render the client-side WireGuard config for a freshly created tunnel.
pub fn render_client_config(
    tunnel: &Tunnel,
    server_public_key: &str,
    server_ip: &str,
    endpoint: &str,
    domain: &str,
) -> String {
    format!(
        "# Arbok tunnel {subdomain}\n\
         # URL: https://{subdomain}.{domain}\n\
         # Expires: {expires}\n\
         \n\
         [Interface]\n\
         Address = {address}/32\n\
         PrivateKey = {private_key}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_public_key}\n\
         AllowedIPs = {server_ip}/32\n\
         Endpoint = {endpoint}\n\
         PersistentKeepalive = 25\n",
        subdomain = tunnel.subdomain,
        domain = domain,
        expires = tunnel.expires_at.to_rfc3339(),
        address = tunnel.allowed_ip,
        private_key = tunnel.private_key,
        server_public_key = server_public_key,
        server_ip = server_ip,
        endpoint = endpoint,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn single_segment_extraction() {
        assert_eq!(single_path_segment("/3000"), Some("3000"));
        assert_eq!(single_path_segment("/abc"), Some("abc"));
        assert_eq!(single_path_segment("/"), None);
        assert_eq!(single_path_segment("/a/b"), None);
    }

    #[test]
    fn config_has_interface_and_peer_sections() {
        let tunnel = Tunnel {
            id: "id".into(),
            subdomain: "happy-cloud-1234".into(),
            port: 3000,
            public_key: "PUB".into(),
            private_key: "PRIV".into(),
            allowed_ip: "10.100.0.2".parse().unwrap(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            last_seen_at: Utc::now(),
            bytes_in: 0,
            bytes_out: 0,
        };

        let config = render_client_config(
            &tunnel,
            "SERVERPUB",
            "10.100.0.1",
            "tunnel.dev:54321",
            "tunnel.dev",
        );

        assert!(config.contains("Address = 10.100.0.2/32"));
        assert!(config.contains("PrivateKey = PRIV"));
        assert!(config.contains("PublicKey = SERVERPUB"));
        assert!(config.contains("AllowedIPs = 10.100.0.1/32"));
        assert!(config.contains("Endpoint = tunnel.dev:54321"));
        assert!(config.contains("PersistentKeepalive = 25"));
        assert!(config.contains("# URL: https://happy-cloud-1234.tunnel.dev"));
    }
}
