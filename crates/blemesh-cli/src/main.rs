//! blemesh CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;

use blemesh_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_configuration(&cli)?;

    CommandDispatcher::execute(cli, config)
        .await
        .context("command failed")?;

    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(config_path) => {
            info!("Loading configuration from: {}", config_path);
            AppConfig::load_from_file(config_path)
                .with_context(|| format!("failed to load {}", config_path))
        }
        None => {
            info!("Using default configuration");
            Ok(AppConfig::default())
        }
    }
}
