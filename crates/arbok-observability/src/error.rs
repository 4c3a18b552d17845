//! Observability error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// Failed to create or register a metric
    #[error("metrics initialization failed: {0}")]
    MetricsInit(String),

    /// Failed to encode the metrics exposition
    #[error("metrics encoding failed: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;
