//! Apply-patch command - Apply file changes atomically to a project.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::info;

use mend_heal::{
    parse_fix_response, FileChangeRequest, FileStatus, LocalFileStore, PatchApplier,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum InputFormat {
    /// JSON array of file change requests
    Json,
    /// Proposer response text with `### FILE:` and diff blocks
    Response,
    /// A single unified diff, applied to `--path`
    Diff,
}

#[derive(Args)]
pub struct ApplyPatchArgs {
    /// Project root the paths are relative to
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Input file (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Input format
    #[arg(short, long, value_enum, default_value = "json")]
    format: InputFormat,

    /// Target path for `--format diff`
    #[arg(long)]
    path: Option<String>,

    /// Check that the batch applies without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

fn read_input(input: Option<&PathBuf>) -> Result<String> {
    match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path)),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn parse_changes(args: &ApplyPatchArgs, text: &str) -> Result<Vec<FileChangeRequest>> {
    let changes = match args.format {
        InputFormat::Json => {
            serde_json::from_str(text).context("Input is not a JSON array of file changes")?
        }
        InputFormat::Response => parse_fix_response(text),
        InputFormat::Diff => {
            let path = args
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--path argument is required with --format diff"))?;
            vec![FileChangeRequest::diff(path, text)]
        }
    };
    Ok(changes)
}

pub async fn execute(args: ApplyPatchArgs) -> Result<()> {
    let text = read_input(args.input.as_ref())?;
    let changes = parse_changes(&args, &text)?;
    if changes.is_empty() {
        anyhow::bail!("No file changes found in input");
    }

    info!(
        "{} {} change(s) in {:?}",
        if args.dry_run { "Checking" } else { "Applying" },
        changes.len(),
        args.root
    );

    let applier = PatchApplier::new(Arc::new(LocalFileStore::new(&args.root)));
    let outcome = if args.dry_run {
        applier.check(&changes)
    } else {
        applier.apply(&changes)
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for file in &outcome.files {
            let icon = match file.status {
                FileStatus::Applied => "✅",
                FileStatus::Unchanged => "➖",
                FileStatus::Rejected => "❌",
                FileStatus::RolledBack | FileStatus::NotAttempted => "↩️",
            };
            match &file.message {
                Some(message) => println!("{} {} ({}): {}", icon, file.path, file.status, message),
                None => println!("{} {} ({})", icon, file.path, file.status),
            }
        }
    }

    if !outcome.applied {
        anyhow::bail!(
            "patch rejected: {}",
            outcome.reason().unwrap_or_else(|| "write failed".to_string())
        );
    }
    if !args.json {
        println!();
        if args.dry_run {
            println!("✅ Batch would apply cleanly");
        } else {
            println!("✅ Applied {} file(s)", outcome.changed_files().len());
        }
    }
    Ok(())
}
