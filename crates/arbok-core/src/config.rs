//! Server configuration
//!
//! Loaded from a TOML file, then overlaid with `ARBOK_`-prefixed
//! environment variables where `A__B` maps onto the `a.b` key path
//! (e.g. `ARBOK_APP__DOMAIN=tunnel.example.com`).

use crate::error::ConfigError;
use crate::humantime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for config overrides.
pub const ENV_PREFIX: &str = "ARBOK_";

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

/// Application-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Apex domain under which tunnel subdomains are exposed
    #[serde(default)]
    pub domain: String,

    /// Log level: debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Admin API authentication.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Opaque bearer keys; empty means open mode (local development)
    #[serde(default)]
    pub api_keys: Vec<String>,
}

/// Tunnel lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Record lifetime at creation
    #[serde(default = "default_ttl", with = "humantime")]
    pub default_ttl: Duration,

    /// Reaper period for expired records
    #[serde(default = "default_cleanup_interval", with = "humantime")]
    pub cleanup_interval: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

/// WireGuard overlay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Overlay network CIDR, /30 or wider
    #[serde(default)]
    pub cidr: String,

    /// Encrypted UDP listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Server private key, base64 (32 bytes)
    #[serde(default)]
    pub private_key: String,

    /// Endpoint advertised in client configs; defaults to
    /// `<app.domain>:<listen_port>`
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cidr: String::new(),
            listen_port: default_listen_port(),
            private_key: String::new(),
            endpoint: None,
        }
    }
}

fn default_listen_port() -> u16 {
    54321
}

/// Public HTTP front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpConfig {
    /// Public HTTP listener, host:port
    #[serde(default)]
    pub listen_addr: String,

    /// CORS origins; empty allows any
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file, overlay `ARBOK_` environment
    /// variables, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut cfg: Config = toml::from_str(&contents).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        cfg.apply_env_overlay(std::env::vars())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay configuration values from environment variables.
    ///
    /// `ARBOK_SERVER__LISTEN_PORT=51820` sets `server.listen_port`.
    /// List values (`auth.api_keys`, `http.allowed_origins`) are
    /// comma-separated.
    pub fn apply_env_overlay(
        &mut self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (name, value) in vars {
            let Some(stripped) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = stripped.to_ascii_lowercase().replace("__", ".");

            match key.as_str() {
                "app.domain" => self.app.domain = value,
                "app.log_level" => self.app.log_level = value,
                "auth.api_keys" => self.auth.api_keys = split_list(&value),
                "tunnel.default_ttl" => {
                    self.tunnel.default_ttl = humantime::parse_duration(&value)
                        .map_err(|e| ConfigError::invalid("tunnel.default_ttl", e))?;
                }
                "tunnel.cleanup_interval" => {
                    self.tunnel.cleanup_interval = humantime::parse_duration(&value)
                        .map_err(|e| ConfigError::invalid("tunnel.cleanup_interval", e))?;
                }
                "server.cidr" => self.server.cidr = value,
                "server.listen_port" => {
                    self.server.listen_port = value
                        .parse()
                        .map_err(|_| ConfigError::invalid("server.listen_port", "not a port"))?;
                }
                "server.private_key" => self.server.private_key = value,
                "server.endpoint" => self.server.endpoint = Some(value),
                "http.listen_addr" => self.http.listen_addr = value,
                "http.allowed_origins" => self.http.allowed_origins = split_list(&value),
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate required keys are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.domain.is_empty() {
            return Err(ConfigError::Missing("app.domain".into()));
        }
        if self.server.cidr.is_empty() {
            return Err(ConfigError::Missing("server.cidr".into()));
        }
        if self.server.private_key.is_empty() {
            return Err(ConfigError::Missing("server.private_key".into()));
        }
        if self.http.listen_addr.is_empty() {
            return Err(ConfigError::Missing("http.listen_addr".into()));
        }
        Ok(())
    }

    /// The UDP endpoint advertised to clients in generated configs.
    pub fn endpoint(&self) -> String {
        match &self.server.endpoint {
            Some(ep) if !ep.is_empty() => ep.clone(),
            _ => format!("{}:{}", self.app.domain, self.server.listen_port),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[app]
domain = "tunnel.example.com"
log_level = "debug"

[auth]
api_keys = ["abc", "def"]

[tunnel]
default_ttl = "24h"
cleanup_interval = "5m"

[server]
cidr = "10.100.0.0/24"
listen_port = 54321
private_key = "WAmgVYXkbT2bCtdcDwolI88/iVi/aV3/PHcUBTQSYmo="

[http]
listen_addr = "0.0.0.0:8080"
allowed_origins = ["https://example.com"]
"#;

    #[test]
    fn parses_sample() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.app.domain, "tunnel.example.com");
        assert_eq!(cfg.auth.api_keys, vec!["abc", "def"]);
        assert_eq!(cfg.tunnel.default_ttl, Duration::from_secs(86400));
        assert_eq!(cfg.tunnel.cleanup_interval, Duration::from_secs(300));
        assert_eq!(cfg.server.listen_port, 54321);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_fill_in() {
        let cfg: Config = toml::from_str(
            r#"
[app]
domain = "t.dev"
[server]
cidr = "10.100.0.0/24"
private_key = "x"
[http]
listen_addr = "127.0.0.1:8080"
"#,
        )
        .unwrap();
        assert_eq!(cfg.app.log_level, "info");
        assert_eq!(cfg.server.listen_port, 54321);
        assert_eq!(cfg.tunnel.default_ttl, Duration::from_secs(86400));
        assert!(cfg.auth.api_keys.is_empty());
    }

    #[test]
    fn env_overlay_maps_double_underscore() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        let vars = vec![
            ("ARBOK_APP__DOMAIN".to_string(), "other.dev".to_string()),
            ("ARBOK_SERVER__LISTEN_PORT".to_string(), "51820".to_string()),
            ("ARBOK_AUTH__API_KEYS".to_string(), "k1, k2".to_string()),
            ("ARBOK_TUNNEL__DEFAULT_TTL".to_string(), "1h".to_string()),
            ("UNRELATED".to_string(), "ignored".to_string()),
        ];
        cfg.apply_env_overlay(vars.into_iter()).unwrap();
        assert_eq!(cfg.app.domain, "other.dev");
        assert_eq!(cfg.server.listen_port, 51820);
        assert_eq!(cfg.auth.api_keys, vec!["k1", "k2"]);
        assert_eq!(cfg.tunnel.default_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn validation_requires_domain_cidr_key_listener() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::Missing(_))));

        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        let mut missing_key = cfg.clone();
        missing_key.server.private_key.clear();
        assert!(missing_key.validate().is_err());
    }

    #[test]
    fn endpoint_falls_back_to_domain_and_port() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.endpoint(), "tunnel.example.com:54321");
        cfg.server.endpoint = Some("1.2.3.4:51820".to_string());
        assert_eq!(cfg.endpoint(), "1.2.3.4:51820");
    }
}
