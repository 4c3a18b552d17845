//! WebSocket proxying: synthetic upstream handshake, then a raw byte
//! splice below the HTTP framer.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use arbok_overlay::{OverlayStream, TunnelDevice};

use crate::error::ProxyError;
use crate::headers::is_websocket_header;

/// Upper bound on the upstream's handshake response head.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Deadline for the upstream to answer the upgrade request.
const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Proxy a WebSocket upgrade into the overlay.
///
/// Dials the target, replays the upgrade with only the handshake-relevant
/// headers, and — on a `101` from the upstream — answers the public
/// client in kind. Once hyper hands over the raw client connection, both
/// directions are spliced until either side ends; `on_done` receives the
/// copied byte counts.
pub async fn proxy_websocket(
    device: &TunnelDevice,
    target_ip: Ipv4Addr,
    target_port: u16,
    req: Request<Body>,
    on_upgrade: OnUpgrade,
    on_done: impl FnOnce(u64, u64) + Send + 'static,
) -> Result<Response<Body>, ProxyError> {
    let mut upstream = device.dial_tcp(target_ip, target_port).await?;

    let handshake = synthetic_upgrade_request(&req, target_ip, target_port);
    let (status, headers, leftover) = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        upstream.write_all(handshake.as_bytes()).await?;
        read_response_head(&mut upstream).await
    })
    .await
    .map_err(|_| ProxyError::Handshake("upstream handshake timed out".into()))??;
    if status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        return Err(ProxyError::Handshake(format!(
            "upstream answered {status}, expected 101"
        )));
    }

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .body(Body::empty())
        .expect("static response parts");
    *response.headers_mut() = headers;

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let (sent, received) = splice(TokioIo::new(upgraded), upstream, leftover).await;
                debug!(sent, received, "websocket splice finished");
                on_done(sent, received);
            }
            Err(e) => {
                warn!(error = %e, "client upgrade failed");
            }
        }
    });

    Ok(response)
}

/// Render the upstream `GET` carrying only the upgrade-relevant headers.
fn synthetic_upgrade_request<B>(req: &Request<B>, ip: Ipv4Addr, port: u16) -> String {
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    let mut out = format!("GET {path} HTTP/1.1\r\nHost: {ip}:{port}\r\n");
    for (name, value) in req.headers() {
        if name.as_str() == "host" || !is_websocket_header(name) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push_str(name.as_str());
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
    out.push_str("\r\n");
    out
}

/// Read an HTTP/1.1 response head (status line + headers) from a raw
/// stream. Returns the status code, the parsed headers, and any bytes
/// already read past the blank line.
pub(crate) async fn read_response_head<S>(
    stream: &mut S,
) -> Result<(u16, HeaderMap, Bytes), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::Handshake("response head too large".into()));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::Handshake(
                "upstream closed during handshake".into(),
            ));
        }
    };

    let head = buf.split_to(head_end);
    let leftover = buf.freeze();

    let text = std::str::from_utf8(&head)
        .map_err(|_| ProxyError::Handshake("non-UTF-8 response head".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| ProxyError::Handshake("empty response head".into()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::Handshake(format!("bad status line: {status_line}")))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value.trim()) else {
            continue;
        };
        headers.append(name, value);
    }

    Ok((status, headers, leftover))
}

/// Find the end of the head (the index one past `\r\n\r\n`).
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Copy bytes both ways until either direction ends, then drop both
/// sockets. Returns `(client_to_upstream, upstream_to_client)` counts;
/// the direction still in flight when the other finished reports what it
/// copied so far as zero (the counters are advisory).
async fn splice<C>(client: C, upstream: OverlayStream, leftover: Bytes) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let mut head_start = 0u64;
    if !leftover.is_empty() {
        if client_wr.write_all(&leftover).await.is_err() {
            return (0, 0);
        }
        head_start = leftover.len() as u64;
    }

    // Paired cancellation: whichever copy finishes first drops the other,
    // which closes both halves of that direction.
    tokio::select! {
        sent = tokio::io::copy(&mut client_rd, &mut upstream_wr) => {
            (sent.unwrap_or(0), head_start)
        }
        received = tokio::io::copy(&mut upstream_rd, &mut client_wr) => {
            (0, head_start + received.unwrap_or(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_101_response_head() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
            \r\n";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let (status, headers, leftover) = read_response_head(&mut cursor).await.unwrap();
        assert_eq!(status, 101);
        assert_eq!(headers["upgrade"], "websocket");
        assert_eq!(
            headers["sec-websocket-accept"],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn keeps_bytes_past_the_head() {
        let raw = b"HTTP/1.1 101 X\r\n\r\n\x81\x05hello";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        let (status, _, leftover) = read_response_head(&mut cursor).await.unwrap();
        assert_eq!(status, 101);
        assert_eq!(&leftover[..], b"\x81\x05hello");
    }

    #[tokio::test]
    async fn rejects_truncated_head() {
        let raw = b"HTTP/1.1 101 Swit";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        assert!(read_response_head(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn rejects_garbage_status_line() {
        let raw = b"NOT HTTP\r\n\r\n";
        let mut cursor = std::io::Cursor::new(&raw[..]);
        assert!(read_response_head(&mut cursor).await.is_err());
    }

    #[test]
    fn synthetic_request_carries_only_upgrade_headers() {
        let req = Request::builder()
            .uri("/socket?room=7")
            .header("Host", "app.tunnel.dev")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
            .header("Cookie", "secret=1")
            .header("Authorization", "Bearer t")
            .body(())
            .unwrap();

        let text = synthetic_upgrade_request(&req, "10.100.0.2".parse().unwrap(), 3000);
        assert!(text.starts_with("GET /socket?room=7 HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.100.0.2:3000\r\n"));
        assert!(text.contains("upgrade: websocket\r\n"));
        assert!(text.contains("sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(!text.contains("Cookie"));
        assert!(!text.contains("Authorization"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
