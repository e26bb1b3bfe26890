//! fleetmux - model-aware routing for a fleet of inference workers.
//!
//! Starts the client-facing HTTP API and the control-plane stream on one
//! port, plus the ping broadcaster and the maintenance planner. All state is
//! soft and rebuilt from worker heartbeats after a restart.

use anyhow::{Context, Result};
use clap::Parser;
use fleetmux::{Config, MemoryPolicyStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetmux")]
#[command(about = "Router for a fleet of single-host inference workers")]
struct Args {
    /// Port to listen on (overrides HTTP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("fleetmux=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.http_port = port;
    }

    info!("starting fleetmux");

    let metrics_handle = fleetmux::telemetry::install();

    let policies = Arc::new(MemoryPolicyStore::new());
    let app = fleetmux::build_app(&config, policies);

    // Prometheus exporter on its own port.
    if config.metrics_port != 0
        && let Some(handle) = metrics_handle
    {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("failed to bind metrics to {metrics_addr}"))?;
        info!(addr = %metrics_addr, "serving metrics");

        let metrics_router = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_router).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    // Ping broadcast keeps heartbeat freshness bounded even when a worker's
    // own heartbeat tick is slow.
    {
        let control = app.control.clone();
        let interval = config.status_poll_interval();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                control.broadcast_ping();
            }
        });
    }

    let _planner_handle = app.planner.clone().spawn();

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(addr = %addr, "listening for requests");

    // Header reads are bounded at 5 s and idle connections closed after
    // 120 s; there is no write timeout, so responses stream for as long as
    // generation runs.
    fleetmux::serve::serve(listener, app.router)
        .await
        .context("server error")?;

    Ok(())
}
