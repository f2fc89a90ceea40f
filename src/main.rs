//! bakvault - scheduled archive, encrypt and upload
//!
//! Main binary entry point for the command-line interface.

use anyhow::Context;
use bakvault::cli::{self, Cli, Commands};
use bakvault::{initialize, logging, Config};
use clap::Parser;
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            if logging::init_logging(cli.verbose, None).is_err() {
                eprintln!("Cannot load {}: {}", cli.config.display(), e);
            }
            error!(severity = "critical", "Cannot load {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(cli.verbose, config.directory.log_path.as_deref()) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(severity = "critical", "{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    let ctx = initialize(config).context("Invalid configuration")?;

    match command {
        Commands::Backup(args) => {
            let schedule = args.schedule;
            cli::backup::run(args, &ctx).with_context(|| format!("{} backup failed", schedule))
        }
        Commands::Put(args) => cli::put::run(args, &ctx).context("Upload failed"),
        Commands::Decrypt(args) => cli::decrypt::run(args, &ctx).context("Decryption failed"),
        Commands::Verify(args) => cli::verify::run(args, &ctx).context("Verification failed"),
    }
}
