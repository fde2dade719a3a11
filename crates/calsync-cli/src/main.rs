//! calsync CLI entry point.

use std::process::ExitCode;

use calsync_core::{TracingConfig, init_tracing};
use clap::Parser;

use calsync_cli::cli::{Cli, Command, ConfigAction};
use calsync_cli::commands;
use calsync_cli::config::CliConfig;
use calsync_cli::error::CliResult;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = if cli.debug {
        TracingConfig::cli_debug()
    } else if matches!(cli.command, Command::Run) {
        TracingConfig::daemon()
    } else {
        TracingConfig::cli()
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("warning: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error [{}]: {}", e.code(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let (config, path) = match cli.config {
        Some(path) => (CliConfig::load_from(&path)?, path),
        None => (CliConfig::load()?, CliConfig::default_path()),
    };

    match cli.command {
        Command::Run => commands::run::run(&config).await,
        Command::Events { days, account } => commands::query::events(&config, days, account).await,
        Command::Check => commands::query::check(&config).await,
        Command::Stats => commands::query::stats(&config).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, &path),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(&config, &path),
        },
    }
}
