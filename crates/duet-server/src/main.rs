//! # Duet Server
//!
//! Direct-messaging presence and delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! duet
//!
//! # Run with custom config
//! duet --config /path/to/duet.toml
//!
//! # Run with environment variables
//! DUET_PORT=8080 DUET_HOST=0.0.0.0 duet
//! ```

use anyhow::Result;
use clap::Parser;
use duet_server::{config, handlers, metrics};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Direct-messaging presence and delivery server")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duet=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = config::Config::load(cli.config.as_deref())?;

    tracing::info!("Starting Duet server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
