//! Shared handler state.

use std::sync::Arc;

use arbok_overlay::TunnelDevice;
use arbok_registry::Registry;

use crate::auth::AuthGate;

/// Front-end configuration derived from the server config at startup.
#[derive(Debug)]
pub struct FrontendConfig {
    /// Apex domain for tunnel subdomains
    pub domain: String,
    /// UDP endpoint advertised in client configs
    pub endpoint: String,
    /// CORS origins; empty allows any
    pub allowed_origins: Vec<String>,
    /// The apex's own first label; requests naming it never resolve to a
    /// tunnel
    reserved_label: String,
}

impl FrontendConfig {
    pub fn new(domain: String, endpoint: String, allowed_origins: Vec<String>) -> Self {
        let reserved_label = domain.split('.').next().unwrap_or_default().to_string();
        Self {
            domain,
            endpoint,
            allowed_origins,
            reserved_label,
        }
    }

    pub fn reserved_label(&self) -> &str {
        &self.reserved_label
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct ApiState {
    pub cfg: Arc<FrontendConfig>,
    pub device: Arc<TunnelDevice>,
    pub registry: Arc<Registry>,
    pub auth: Arc<AuthGate>,
}
