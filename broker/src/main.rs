//! Broker entry point: logging, shared state, the periodic traffic flush
//! and the axum server.

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use lattice_broker::{build_router, AppState};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "lattice-broker", version, about = "Lattice relay broker")]
struct Args {
    /// Listen address for agent links and the inspection API.
    #[arg(long, default_value = "0.0.0.0:7070")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lattice_broker=info".into()),
        )
        .init();

    let args = Args::parse();
    let state = AppState::new();

    // Per-second drain of the broker-side counters. Persistence lives in the
    // management plane; the broker only surfaces the rollup.
    let traffic = state.traffic.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tick.tick().await;
            for row in traffic.snapshot() {
                let (rule_id, agent_id) = &row.key;
                debug!(
                    rule = %rule_id,
                    agent = %agent_id,
                    bytes_in = row.bytes_in,
                    bytes_out = row.bytes_out,
                    connections = row.connections,
                    active = row.active,
                    "traffic rollup"
                );
            }
        }
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("broker listening on {}", args.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;
    Ok(())
}
