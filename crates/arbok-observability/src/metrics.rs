//! Prometheus metrics exposition
//!
//! One process-wide metrics instance, initialized eagerly at startup and
//! reachable from every crate through [`metrics`].

use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::error::{ObservabilityError, Result};

/// Arbok metrics collection.
pub struct ArbokMetrics {
    registry: Registry,

    // Tunnel lifecycle
    /// Currently live tunnel records
    pub tunnels_active: IntGauge,
    /// Total tunnels created
    pub tunnels_created_total: IntCounter,
    /// Total tunnels deleted via the admin API or shutdown
    pub tunnels_deleted_total: IntCounter,
    /// Total tunnels removed by the reaper
    pub tunnels_expired_total: IntCounter,

    // Address pool
    /// Overlay IPs still available for allocation
    pub ip_pool_available: IntGauge,
    /// Allocation attempts that found the pool exhausted
    pub ip_pool_exhausted_total: IntCounter,

    // HTTP front-end
    /// Total HTTP requests by method and status
    pub http_requests_total: IntCounterVec,
    /// HTTP request duration in seconds by method
    pub http_request_duration_seconds: HistogramVec,
    /// Bytes copied through tunnel proxying
    pub http_bytes_proxied_total: IntCounter,

    // WireGuard device
    /// Peers currently installed in the device table
    pub wireguard_peers_active: IntGauge,
    /// Errors from the encrypted transport or peer operations
    pub wireguard_errors_total: IntCounter,

    // Auth gate
    /// Rejected admin API requests
    pub auth_failures_total: IntCounter,
    /// Accepted admin API requests
    pub auth_successes_total: IntCounter,
}

impl ArbokMetrics {
    /// Create a new metrics collection with its own registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tunnels_active = IntGauge::new("arbok_tunnels_active", "Currently live tunnel records")
            .map_err(init_err)?;
        let tunnels_created_total =
            IntCounter::new("arbok_tunnels_created_total", "Total tunnels created")
                .map_err(init_err)?;
        let tunnels_deleted_total =
            IntCounter::new("arbok_tunnels_deleted_total", "Total tunnels deleted")
                .map_err(init_err)?;
        let tunnels_expired_total = IntCounter::new(
            "arbok_tunnels_expired_total",
            "Total tunnels removed by the reaper",
        )
        .map_err(init_err)?;

        let ip_pool_available = IntGauge::new(
            "arbok_ip_pool_available",
            "Overlay IPs available for allocation",
        )
        .map_err(init_err)?;
        let ip_pool_exhausted_total = IntCounter::new(
            "arbok_ip_pool_exhausted_total",
            "Allocations rejected because the pool was exhausted",
        )
        .map_err(init_err)?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("arbok_http_requests_total", "Total HTTP requests"),
            &["method", "status"],
        )
        .map_err(init_err)?;
        let http_request_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "arbok_http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method"],
        )
        .map_err(init_err)?;
        let http_bytes_proxied_total = IntCounter::new(
            "arbok_http_bytes_proxied_total",
            "Bytes copied through tunnel proxying",
        )
        .map_err(init_err)?;

        let wireguard_peers_active = IntGauge::new(
            "arbok_wireguard_peers_active",
            "Peers installed in the device table",
        )
        .map_err(init_err)?;
        let wireguard_errors_total = IntCounter::new(
            "arbok_wireguard_errors_total",
            "Errors from the encrypted transport",
        )
        .map_err(init_err)?;

        let auth_failures_total = IntCounter::new(
            "arbok_auth_failures_total",
            "Rejected admin API requests",
        )
        .map_err(init_err)?;
        let auth_successes_total = IntCounter::new(
            "arbok_auth_successes_total",
            "Accepted admin API requests",
        )
        .map_err(init_err)?;

        registry.register(Box::new(tunnels_active.clone())).ok();
        registry
            .register(Box::new(tunnels_created_total.clone()))
            .ok();
        registry
            .register(Box::new(tunnels_deleted_total.clone()))
            .ok();
        registry
            .register(Box::new(tunnels_expired_total.clone()))
            .ok();
        registry.register(Box::new(ip_pool_available.clone())).ok();
        registry
            .register(Box::new(ip_pool_exhausted_total.clone()))
            .ok();
        registry
            .register(Box::new(http_requests_total.clone()))
            .ok();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .ok();
        registry
            .register(Box::new(http_bytes_proxied_total.clone()))
            .ok();
        registry
            .register(Box::new(wireguard_peers_active.clone()))
            .ok();
        registry
            .register(Box::new(wireguard_errors_total.clone()))
            .ok();
        registry.register(Box::new(auth_failures_total.clone())).ok();
        registry
            .register(Box::new(auth_successes_total.clone()))
            .ok();

        Ok(Self {
            registry,
            tunnels_active,
            tunnels_created_total,
            tunnels_deleted_total,
            tunnels_expired_total,
            ip_pool_available,
            ip_pool_exhausted_total,
            http_requests_total,
            http_request_duration_seconds,
            http_bytes_proxied_total,
            wireguard_peers_active,
            wireguard_errors_total,
            auth_failures_total,
            auth_successes_total,
        })
    }

    /// The underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode the exposition in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .map_err(|e| ObservabilityError::Encode(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| ObservabilityError::Encode(e.to_string()))
    }

    /// Record a completed HTTP request.
    pub fn record_request(&self, method: &str, status: u16, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method])
            .observe(duration_secs);
    }
}

fn init_err(e: prometheus::Error) -> ObservabilityError {
    ObservabilityError::MetricsInit(e.to_string())
}

static METRICS: OnceLock<ArbokMetrics> = OnceLock::new();

/// Initialize the global metrics instance. Idempotent.
pub fn init_metrics() -> &'static ArbokMetrics {
    metrics()
}

/// The global metrics instance, initialized on first use.
pub fn metrics() -> &'static ArbokMetrics {
    METRICS.get_or_init(|| ArbokMetrics::new().expect("failed to initialize metrics"))
}

/// Axum handler for the `/metrics` scrape endpoint.
pub async fn metrics_handler() -> impl axum::response::IntoResponse {
    use axum::http::StatusCode;

    match metrics().encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
