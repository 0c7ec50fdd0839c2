//! # Roomcast Server
//!
//! Real-time chat room hub.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory pub/sub, single process)
//! roomcast
//!
//! # Run with a specific config file
//! roomcast --config /path/to/roomcast.toml
//!
//! # Fan out across processes through Redis
//! ROOMCAST__PUBSUB__BACKEND=redis ROOMCAST__PUBSUB__URL=redis://127.0.0.1:6379 roomcast
//!
//! # Accept a token
//! ROOMCAST__AUTH__TOKENS__alice=s3cret roomcast
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "roomcast", version, about = "Real-time chat room hub")]
struct Args {
    /// Configuration file to load instead of the default search paths.
    /// Environment overrides are not applied to it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match args.config {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Roomcast server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
