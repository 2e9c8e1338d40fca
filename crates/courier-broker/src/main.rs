//! Courier Broker - standalone queue broker for courier remoting.
//!
//! Callers and receivers in separate processes connect to this broker
//! through `courier_core::broker::BrokerTransport`.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::broker::BrokerServer;
use courier_core::BrokerConfig;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "courier-broker")]
#[command(about = "Queue broker for courier remoting")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = BrokerConfig::DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = BrokerConfig::DEFAULT_HOST)]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting courier broker");

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;

    let handle = BrokerServer::start(addr).await?;

    // Print port for launchers to read (intentional stdout)
    println!("BROKER_PORT={}", handle.port());

    info!("Broker running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    drop(handle);
    Ok(())
}
