//! Config command - Show, initialize or validate configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use mend_core::MendConfig;

#[derive(Args)]
pub struct ConfigArgs {
    /// Workspace root used to discover `.mend/config.yaml`
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as YAML
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration file
    Validate,
}

pub async fn execute(args: ConfigArgs, explicit: Option<PathBuf>) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = super::load_config(explicit.as_ref(), &args.root)?;
            print!("{}", serde_yaml::to_string(&config)?);
        }
        ConfigAction::Init { force } => {
            let path = explicit.unwrap_or_else(|| MendConfig::default_path(&args.root));
            if path.exists() && !force {
                anyhow::bail!("Config already exists at {:?} (use --force to overwrite)", path);
            }
            MendConfig::default()
                .save(&path)
                .with_context(|| format!("Failed to write config {:?}", path))?;
            println!("✅ Wrote default configuration to {:?}", path);
        }
        ConfigAction::Validate => {
            super::load_config(explicit.as_ref(), &args.root)?;
            println!("✅ Configuration is valid");
        }
    }
    Ok(())
}
