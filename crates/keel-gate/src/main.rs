//! keel-gate: the scheduler gate process.
//!
//! ```text
//! keel-gate --server-addr 0.0.0.0:8080 --name g1 --level debug
//! ```

mod config;
mod http;
mod stream;

use anyhow::Context;
use clap::Parser;
use keel_core::app::GateBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Cli;
use crate::http::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.level);

    let coord = cli.coordination()?;
    let bind_addr = cli.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let server_addr = listener.local_addr()?.to_string();

    let config = cli.gate_config(server_addr.clone());
    let mut gate = GateBuilder::new(config).coordination(coord).build()?;
    gate.start().await.context("gate failed to start")?;

    let app = router(AppState::from_gate(&gate));
    info!(address = %server_addr, node = %gate.identity(), "listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    gate.shutdown().await;
    served?;
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    info!("shutdown requested");
}
