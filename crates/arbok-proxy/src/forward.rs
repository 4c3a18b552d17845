//! Plain HTTP proxying over the overlay.

use axum::body::Body;
use http::uri::Uri;
use http::{header, HeaderValue, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, warn};

use arbok_overlay::TunnelDevice;

use crate::error::ProxyError;
use crate::headers::{set_forwarded_headers, strip_hop_by_hop};

/// Forward one request to `target_ip:target_port` through the device.
///
/// Each request gets its own HTTP/1.1 client connection: overlay dials
/// are cheap (no kernel handshake beyond the netstack's) and per-request
/// connections keep cancellation trivial — dropping the response body
/// drops the connection task.
pub async fn proxy_http(
    device: &TunnelDevice,
    target_ip: Ipv4Addr,
    target_port: u16,
    client_ip: IpAddr,
    mut req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let original_host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();

    // Rewrite to origin-form against the upstream authority.
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    *req.uri_mut() = path_and_query
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("/"));

    let authority = format!("{target_ip}:{target_port}");
    strip_hop_by_hop(req.headers_mut());
    set_forwarded_headers(req.headers_mut(), client_ip, &original_host);
    if let Ok(value) = HeaderValue::from_str(&authority) {
        req.headers_mut().insert(header::HOST, value);
    }

    let stream = device.dial_tcp(target_ip, target_port).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection ended");
        }
    });

    let mut response = sender.send_request(req).await.map_err(|e| {
        warn!(error = %e, authority = %authority, "upstream request failed");
        ProxyError::Upstream(e)
    })?;

    strip_hop_by_hop(response.headers_mut());
    Ok(response.map(Body::new))
}
