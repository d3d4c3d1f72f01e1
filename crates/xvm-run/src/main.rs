//! XVM contract runner.

mod commands;
mod config;
mod telemetry;

use clap::Parser;
use commands::Cli;
use tracing::debug;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(&cli)?;

    match &config.logging.log_file {
        Some(path) => telemetry::init_telemetry_with_file(&config.logging.level, path)?,
        None => telemetry::init_telemetry(&config.logging.level, config.logging.format == "json")?,
    }
    debug!(?config, "configuration loaded");

    commands::execute(cli.command, config)
}
