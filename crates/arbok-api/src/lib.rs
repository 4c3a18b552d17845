//! Arbok API — the public HTTP front-end.
//!
//! One listener carries four surfaces: health/metrics probes, curl-style
//! provisioning (`GET /{port}`), the authenticated JSON admin API under
//! `/api`, and the subdomain proxy dispatch that forwards everything else
//! into the overlay.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

pub use auth::AuthGate;
pub use error::ApiError;
pub use router::build_router;
pub use state::{ApiState, FrontendConfig};
