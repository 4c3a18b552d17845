//! Arbok observability — process-wide Prometheus metrics.

pub mod error;
pub mod metrics;

pub use error::ObservabilityError;
pub use metrics::{init_metrics, metrics, metrics_handler, ArbokMetrics};
