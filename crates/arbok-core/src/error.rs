//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at startup: the binary prints the error and
/// exits with status 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required configuration key
    #[error("missing required configuration: {0}")]
    Missing(String),

    /// Invalid configuration value
    #[error("invalid configuration for {key}: {reason}")]
    Invalid { key: String, reason: String },

    /// Failed to read or parse the configuration file
    #[error("failed to load config from {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
