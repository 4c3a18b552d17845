//! arbokd — the arbok tunnel server.
//!
//! Wires the components together in dependency order (device → registry →
//! auth → router), installs signal handlers, and performs ordered
//! shutdown within a bounded budget.

mod cli;

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arbok_api::{build_router, ApiState, AuthGate, FrontendConfig};
use arbok_core::Config;
use arbok_overlay::{DeviceConfig, TunnelDevice};
use arbok_registry::{Registry, RegistryConfig};

use cli::Cli;

/// Overall shutdown budget; steps that would overrun it are abandoned.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);
/// Graceful HTTP drain deadline within the budget.
const HTTP_SHUTDOWN: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&cfg.app.log_level);
    arbok_observability::init_metrics();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting arbok server");

    let server_ip = arbok_overlay::server_ip_for_cidr(&cfg.server.cidr)
        .context("invalid server.cidr")?;

    let device = Arc::new(
        TunnelDevice::new(DeviceConfig::new(
            cfg.server.private_key.clone(),
            cfg.server.listen_port,
            server_ip,
        ))
        .await
        .context("failed to start tunnel device")?,
    );

    let registry = Registry::new(
        RegistryConfig {
            cidr: cfg.server.cidr.clone(),
            default_ttl: cfg.tunnel.default_ttl,
            cleanup_interval: cfg.tunnel.cleanup_interval,
        },
        device.clone(),
    )
    .context("failed to start registry")?;

    let state = ApiState {
        cfg: Arc::new(FrontendConfig::new(
            cfg.app.domain.clone(),
            cfg.endpoint(),
            cfg.http.allowed_origins.clone(),
        )),
        device: device.clone(),
        registry: registry.clone(),
        auth: Arc::new(AuthGate::new(cfg.auth.api_keys.clone())),
    };
    let router = build_router(state);

    let listener = TcpListener::bind(&cfg.http.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.listen_addr))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(arbok_api::server::serve(listener, router, async move {
        let _ = shutdown_rx.await;
    }));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        result = &mut server => {
            // listener died before any signal; propagate
            result.context("server task panicked")??;
            return Ok(());
        }
    }

    let started = Instant::now();
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(HTTP_SHUTDOWN, &mut server).await.is_err() {
        warn!("http shutdown deadline exceeded, aborting listener");
        server.abort();
    }

    if tokio::time::timeout(remaining(started), registry.close())
        .await
        .is_err()
    {
        warn!("registry shutdown deadline exceeded");
    }

    if tokio::time::timeout(remaining(started), device.close())
        .await
        .is_err()
    {
        warn!("device shutdown deadline exceeded");
    }

    info!("shutdown complete");
    Ok(())
}

fn remaining(started: Instant) -> Duration {
    SHUTDOWN_BUDGET.saturating_sub(started.elapsed())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
