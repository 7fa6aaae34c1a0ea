//! frame-bench: a length-prefixed framing protocol and round-trip benchmark
//!
//! Two modes share one binary:
//! - `serve`: concurrent server answering WHO and TEST frames
//! - `bench`: client measuring round-trip latency and message sizes
//!
//! Features:
//! - Fixed 7-byte ASCII header framing (2-digit command, 5-digit payload length)
//! - One task per connection, isolated failures
//! - Append-only trace file shared by all connections
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod protocol;
mod server;
mod trace;

use client::Bench;
use config::{Config, Mode};
use server::Server;
use std::sync::Arc;
use trace::TraceSink;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let sink = Arc::new(match &config.log_file {
        Some(path) => TraceSink::file(path)?,
        None => TraceSink::disabled(),
    });

    match config.mode {
        Mode::Serve => run_server(config, sink).await,
        Mode::Bench => run_bench(config, sink).await,
    }
}

async fn run_server(
    config: Config,
    sink: Arc<TraceSink>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        backlog = config.backlog,
        payload_min = config.payload.min,
        payload_max = config.payload.max,
        "Starting frame-bench server"
    );

    let server = Server::bind(&config, sink).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;
    Ok(())
}

async fn run_bench(
    config: Config,
    sink: Arc<TraceSink>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        connect = %config.connect,
        exchanges = config.exchanges,
        payload_min = config.payload.min,
        payload_max = config.payload.max,
        "Starting benchmark"
    );

    let mut bench = Bench::new(&config, Arc::clone(&sink));
    let result = bench.connect_and_run(&config.connect).await;
    sink.close();

    match result {
        Ok(summary) => {
            print!("{summary}");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Benchmark run incomplete");
            Err(e.into())
        }
    }
}
