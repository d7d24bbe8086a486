//! Hash command - Show how an error message is normalized.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use mend_heal::Normalizer;

#[derive(Args)]
pub struct HashArgs {
    /// Error message (read from stdin when omitted)
    message: Option<String>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: HashArgs) -> Result<()> {
    let message = super::message_or_stdin(args.message)?;
    let normalizer = Normalizer::global();
    let normalized = normalizer.normalize(&message);
    let hash = normalizer.hash(&message);

    if args.json {
        let output = json!({ "hash": hash, "normalized": normalized });
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("{}  {}", hash, normalized);
    }
    Ok(())
}
