//! CLI command definitions.
//!
//! Each subcommand maps to one piece of the fix loop that can be run on its
//! own, plus `watch`, which runs the whole loop.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod apply_patch;
pub mod classify;
pub mod config;
pub mod hash;
pub mod watch;

/// Mender - autonomous build, fix and restart loop
#[derive(Parser)]
#[command(name = "mend")]
#[command(version, about = "Mender - autonomous build, fix and restart loop")]
#[command(long_about = r#"
Mender watches generated projects, classifies the errors their builds and
previews report, applies bounded fixes and restarts the sandbox to verify them.

COMMANDS:
  classify      → Classify an error message
  hash          → Show the normalized form and hash of an error message
  apply-patch   → Apply a batch of file changes atomically
  watch         → Run the fix loop on error reports read from stdin
  config        → Show, initialize or validate configuration

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Configuration error
  4 - Patch rejected
  5 - Sandbox runtime unavailable
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    /// Config file (defaults to ./.mend/config.yaml when present)
    #[arg(short, long, global = true, env = "MEND_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify an error message
    Classify(classify::ClassifyArgs),

    /// Normalize and hash an error message
    Hash(hash::HashArgs),

    /// Apply file changes to a project as one atomic batch
    #[command(name = "apply-patch")]
    ApplyPatch(apply_patch::ApplyPatchArgs),

    /// Run the fix loop on JSON-line error reports from stdin
    Watch(watch::WatchArgs),

    /// Manage configuration
    Config(config::ConfigArgs),
}

/// Message from the argument, or all of stdin when omitted.
pub(crate) fn message_or_stdin(message: Option<String>) -> anyhow::Result<String> {
    use std::io::Read;

    match message {
        Some(message) => Ok(message),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            let trimmed = buf.trim_end().to_string();
            if trimmed.is_empty() {
                anyhow::bail!("No error message given as argument or on stdin");
            }
            Ok(trimmed)
        }
    }
}

/// Effective configuration: explicit file, else discovered, then env overrides.
pub(crate) fn load_config(
    explicit: Option<&PathBuf>,
    root: &std::path::Path,
) -> anyhow::Result<mend_core::MendConfig> {
    use anyhow::Context;
    use mend_core::MendConfig;

    let config = match explicit {
        Some(path) => MendConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => MendConfig::discover(root).context("Failed to load config")?,
    };
    let config = config.apply_env();
    config.validate().context("Invalid config after environment overrides")?;
    Ok(config)
}
