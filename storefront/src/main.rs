use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use storefront::{StorefrontSystem, SystemConfig};

#[derive(Parser)]
#[command(name = "storefront")]
struct Args {
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    #[arg(long, env = "RESERVATION_TTL_SECS", default_value = "300")]
    reservation_ttl_secs: u64,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "5")]
    sweep_interval_secs: u64,

    #[arg(long, env = "OUTBOX_INTERVAL_SECS", default_value = "5")]
    outbox_interval_secs: u64,

    #[arg(long, env = "RESERVE_TIMEOUT_MS", default_value = "3000")]
    reserve_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let system = StorefrontSystem::start(SystemConfig {
        reservation_ttl: Duration::from_secs(args.reservation_ttl_secs),
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        outbox_interval: Duration::from_secs(args.outbox_interval_secs),
        reserve_timeout: Duration::from_millis(args.reserve_timeout_ms),
    });

    let app = system.router();
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("storefront listening on port {}", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    system.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for shutdown signal: {err}");
    }
}
