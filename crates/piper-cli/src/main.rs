mod cli;
mod commands;
mod config;
mod logging;
mod output;
mod pipeline;

use anyhow::Result;
use clap::Parser;
use piper_runner::RunStatus;

use cli::{Cli, Commands};
use config::{ConfigError, loader};
use output::print_error;

const EXIT_ABORTED: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(RunStatus::Completed) => 0,
        Ok(_) => EXIT_ABORTED,
        Err(e) => {
            print_error(&format!("{e:#}"));
            if e.chain().any(|cause| cause.is::<ConfigError>()) {
                EXIT_CONFIG
            } else {
                EXIT_ABORTED
            }
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<RunStatus> {
    let cli = Cli::parse();
    let cfg = loader::load_config(&cli.config)?;
    logging::init_tracing(&cfg.logging)?;
    tracing::debug!(config = %cli.config.display(), "Configuration loaded");

    match &cli.command {
        Commands::Run(args) => commands::run::run(&cfg, &cli.config, args).await,
        Commands::Check => {
            commands::check::check(&cfg, &cli.config)?;
            Ok(RunStatus::Completed)
        }
        Commands::Bindings(args) => {
            commands::check::bindings(&cfg, &cli.config, args)?;
            Ok(RunStatus::Completed)
        }
    }
}
