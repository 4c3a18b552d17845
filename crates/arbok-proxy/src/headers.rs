//! Header handling for proxied requests.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Request;
use std::net::IpAddr;

/// Hop-by-hop headers, stripped from both directions of a proxied
/// exchange (RFC 7230 §6.1 plus the common de facto set).
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers forwarded on a synthetic WebSocket upgrade request.
const WEBSOCKET_FORWARD: &[&str] = &["host", "upgrade", "connection"];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Whether the request asks for a connection upgrade.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false)
}

/// Whether the request is a WebSocket upgrade (case-insensitive on both
/// the `Upgrade` value and the `Connection` tokens).
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    if !is_upgrade_request(req) {
        return false;
    }
    req.headers()
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Whether a header should ride along on the synthetic upgrade request:
/// `Host`, `Upgrade`, `Connection`, and everything `Sec-WebSocket-*`.
pub fn is_websocket_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    WEBSOCKET_FORWARD.contains(&name) || name.starts_with("sec-websocket-")
}

/// Install the standard forwarding headers on a request heading upstream.
///
/// Appends the client to `X-Forwarded-For`, records the original host in
/// `X-Forwarded-Host`, and pins `X-Forwarded-Proto` to `https` (TLS is
/// terminated in front of us).
pub fn set_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr, original_host: &str) {
    let client = client_ip.to_string();
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {client}"),
        None => client,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert("x-forwarded-host", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
}

/// Host header with any `:port` suffix removed.
pub fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("upgrade").is_none());
        assert!(headers.get("content-type").is_some());
    }

    #[test]
    fn websocket_detection_is_case_insensitive() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "WebSocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let req = Request::builder()
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));
    }

    #[test]
    fn non_websocket_upgrades_are_rejected() {
        let req = Request::builder()
            .header("Connection", "upgrade")
            .header("Upgrade", "h2c")
            .body(())
            .unwrap();
        assert!(!is_websocket_upgrade(&req));

        let req = Request::builder()
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_websocket_upgrade(&req), "missing Connection: upgrade");
    }

    #[test]
    fn websocket_header_selection() {
        assert!(is_websocket_header(&HeaderName::from_static("host")));
        assert!(is_websocket_header(&HeaderName::from_static(
            "sec-websocket-key"
        )));
        assert!(is_websocket_header(&HeaderName::from_static(
            "sec-websocket-extensions"
        )));
        assert!(!is_websocket_header(&HeaderName::from_static("cookie")));
    }

    #[test]
    fn forwarded_for_appends_to_existing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        set_forwarded_headers(&mut headers, "5.6.7.8".parse().unwrap(), "app.example.com");

        assert_eq!(headers["x-forwarded-for"], "1.2.3.4, 5.6.7.8");
        assert_eq!(headers["x-forwarded-host"], "app.example.com");
        assert_eq!(headers["x-forwarded-proto"], "https");
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("app.example.com:8080"), "app.example.com");
        assert_eq!(strip_port("app.example.com"), "app.example.com");
        assert_eq!(strip_port("localhost:80"), "localhost");
    }
}
