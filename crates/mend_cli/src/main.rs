//! Mender CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Configuration error
//! - 4: Patch rejected
//! - 5: Sandbox runtime unavailable

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const CONFIG_ERROR: u8 = 3;
    pub const PATCH_REJECTED: u8 = 4;
    pub const RUNTIME_UNAVAILABLE: u8 = 5;
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "mend=debug,info" } else { "mend=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout carries command output, logs go to stderr
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    // Already initialized is fine
    let _ = tracing_subscriber::registry().with(layer).with(filter).try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let result = match cli.command {
        Commands::Classify(args) => commands::classify::execute(args).await,
        Commands::Hash(args) => commands::hash::execute(args).await,
        Commands::ApplyPatch(args) => commands::apply_patch::execute(args).await,
        Commands::Watch(args) => commands::watch::execute(args, cli.config).await,
        Commands::Config(args) => commands::config::execute(args, cli.config).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    let msg = format!("{:#}", e).to_lowercase();

    if msg.contains("config") {
        ExitCodes::CONFIG_ERROR
    } else if msg.contains("patch rejected") {
        ExitCodes::PATCH_REJECTED
    } else if msg.contains("runtime not available") || msg.contains("docker") {
        ExitCodes::RUNTIME_UNAVAILABLE
    } else if msg.contains("argument") || msg.contains("not found") {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::GENERAL_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_categories() {
        assert_eq!(
            categorize_error(&anyhow::anyhow!("Invalid configuration: bad alpha")),
            ExitCodes::CONFIG_ERROR
        );
        assert_eq!(
            categorize_error(&anyhow::anyhow!("patch rejected: src/a.ts")),
            ExitCodes::PATCH_REJECTED
        );
        assert_eq!(
            categorize_error(&anyhow::anyhow!("Sandbox runtime not available: no socket")),
            ExitCodes::RUNTIME_UNAVAILABLE
        );
        assert_eq!(categorize_error(&anyhow::anyhow!("boom")), ExitCodes::GENERAL_ERROR);
    }
}
