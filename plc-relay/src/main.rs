use clap::Parser;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plc_relay::capture::PcapSource;
use plc_relay::config::{CliArgs, Config, Settings};
use plc_relay::error::ConfigError;
use plc_relay::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            init_tracing("error");
            tracing::error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Logging. RUST_LOG wins over LOG_LEVEL.
    let default_filter = settings.log_level.as_filter();
    init_tracing(&std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()));

    let supervisor = Supervisor::launch(&settings, PcapSource::default()).await?;

    // Signal handler for graceful shutdown.
    let handle = supervisor.handle();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping capture...");
        handle.stop();
    })?;

    if let Err(e) = supervisor.wait().await {
        tracing::error!("Relay error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn load_settings(cli: &CliArgs) -> Result<Settings, ConfigError> {
    // Load config from file if provided, otherwise use defaults.
    let mut config = match cli.config {
        Some(ref path) => Config::from_file(Path::new(path))?,
        None => Config::default(),
    };
    config.merge_cli(cli);
    config.validate()
}

fn init_tracing(filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
