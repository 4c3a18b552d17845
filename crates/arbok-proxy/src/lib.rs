//! Arbok proxy — bridges public HTTP traffic into the overlay.
//!
//! Plain requests are re-issued over a per-request HTTP/1.1 client
//! connection dialed through the tunnel device; WebSocket upgrades are
//! spliced below the HTTP framer with paired cancellation.

pub mod error;
pub mod forward;
pub mod headers;
pub mod upgrade;

pub use error::ProxyError;
pub use forward::proxy_http;
pub use upgrade::proxy_websocket;
