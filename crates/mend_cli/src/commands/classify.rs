//! Classify command - Classify an error message.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use mend_heal::{error_hash, Classifier, ClassifyContext, RuleClassifier};

#[derive(Args)]
pub struct ClassifyArgs {
    /// Error message (read from stdin when omitted)
    message: Option<String>,

    /// File the error was reported against
    #[arg(short, long)]
    file: Option<String>,

    /// Framework hint (nextjs, vite, fastapi, ...)
    #[arg(long)]
    framework: Option<String>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: ClassifyArgs) -> Result<()> {
    let message = super::message_or_stdin(args.message)?;

    let mut context = ClassifyContext::default();
    if let Some(file) = args.file {
        context = context.with_file(file);
    }
    if let Some(framework) = args.framework {
        context = context.with_framework(framework);
    }

    let classifier = RuleClassifier::new()?;
    let classification = classifier.classify(&message, &context);
    let hash = error_hash(&message);

    if args.json {
        let output = json!({ "hash": hash, "classification": classification });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Hash:      {}", hash);
    println!("Kind:      {}", classification.kind);
    println!("Category:  {}", classification.category);
    println!(
        "Rule:      {}",
        classification.rule_id.as_deref().unwrap_or("(none)")
    );
    println!(
        "Fixable:   {}",
        if classification.fixable { "✅ yes" } else { "❌ no" }
    );
    println!("Hint:      {}", classification.hint);

    let details = &classification.details;
    if let Some(port) = details.port {
        println!("Port:      {}", port);
    }
    if let Some(package) = &details.package {
        println!("Package:   {}", package);
    }
    if let Some(file) = &details.file {
        match details.line {
            Some(line) => println!("Location:  {}:{}", file, line),
            None => println!("Location:  {}", file),
        }
    }

    Ok(())
}
