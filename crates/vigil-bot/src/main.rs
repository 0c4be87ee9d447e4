//! Vigil - execution and position-risk service entry point.
//!
//! Observation mode: exit decisions are logged only
//! Paper mode: exit decisions are executed against the paper exchange

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Vigil execution and position-risk service
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via VIGIL_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // CLI arg > VIGIL_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("VIGIL_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = vigil_bot::AppConfig::from_file(&config_path)?;

    vigil_telemetry::init_logging(&config.telemetry.log_level)?;
    info!("Starting vigil v{}", env!("CARGO_PKG_VERSION"));
    info!(config_path = %config_path, mode = ?config.mode, "Configuration loaded");

    let app = vigil_bot::Application::new(config)?;
    app.run().await?;

    Ok(())
}
