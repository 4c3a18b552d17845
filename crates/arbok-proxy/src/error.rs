//! Proxy error types

use arbok_overlay::OverlayError;
use thiserror::Error;

/// Errors while proxying into the overlay. All of them surface to the
/// public client as `502 Bad Gateway`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Could not reach the tunnel peer
    #[error("overlay dial failed: {0}")]
    Dial(#[from] OverlayError),

    /// The upstream HTTP exchange failed
    #[error("upstream error: {0}")]
    Upstream(#[from] hyper::Error),

    /// The upstream rejected or mangled a WebSocket handshake
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// Raw socket I/O toward the upstream failed
    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
}
