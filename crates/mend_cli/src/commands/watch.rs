//! Watch command - Run the fix loop on error reports read from stdin.
//!
//! Each stdin line is one JSON object: either an error report
//! (`{"project_id": "todo", "message": "...", "file_path": "src/app/page.tsx"}`)
//! or an operator command (`{"op": "reset_circuit", "project_id": "todo"}`).
//! Fix outcomes and command results are written to stdout as JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mend_core::{ErrorReport, EventBus, EventJournal, ProjectId};
use mend_heal::{AutoFixOrchestrator, CommandProposer, LocalFileStore, ProposerRegistry};
use mend_runner::{
    DockerRuntime, MockRuntime, SandboxLifecycleManager, SandboxRuntime, SandboxSpec, StepPolicy,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RuntimeKind {
    /// Docker daemon via its API
    Docker,
    /// In-process runtime that always succeeds (dry runs)
    Mock,
}

#[derive(Args)]
pub struct WatchArgs {
    /// Project to watch as `<id>=<dir>` (repeatable)
    #[arg(short, long = "project", value_parser = parse_project, required = true)]
    projects: Vec<(String, PathBuf)>,

    /// Workspace root for config discovery and the event journal
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Sandbox runtime
    #[arg(long, value_enum, default_value = "docker")]
    runtime: RuntimeKind,

    /// Print events to stderr as they are published
    #[arg(long)]
    events: bool,

    /// Do not write the event journal
    #[arg(long)]
    no_journal: bool,

    /// Leave sandboxes running on exit
    #[arg(long)]
    keep: bool,
}

fn parse_project(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((id, dir)) if !id.is_empty() && !dir.is_empty() => {
            Ok((id.to_string(), PathBuf::from(dir)))
        }
        _ => Err(format!("expected <id>=<dir>, got '{}'", raw)),
    }
}

/// Operator commands accepted on stdin.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    ResetCircuit { project_id: ProjectId },
    ResetBudget { project_id: ProjectId },
    ClearCache,
    Metrics,
    Resume { project_id: ProjectId },
    Cancel { project_id: ProjectId },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Line {
    Op(Op),
    Report(ErrorReport),
}

fn emit<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize output: {}", e),
    }
}

fn run_op(orchestrator: &AutoFixOrchestrator, op: Op) {
    match op {
        Op::ResetCircuit { project_id } => {
            orchestrator.reset_circuit(&project_id);
            emit(&json!({ "op": "reset_circuit", "project_id": project_id, "ok": true }));
        }
        Op::ResetBudget { project_id } => {
            orchestrator.reset_budget(&project_id);
            emit(&json!({ "op": "reset_budget", "project_id": project_id, "ok": true }));
        }
        Op::ClearCache => {
            orchestrator.clear_cache();
            emit(&json!({ "op": "clear_cache", "ok": true }));
        }
        Op::Metrics => {
            emit(&json!({ "op": "metrics", "metrics": orchestrator.get_metrics() }));
        }
        Op::Resume { project_id } => match orchestrator.resume_project(&project_id) {
            Ok(()) => emit(&json!({ "op": "resume", "project_id": project_id, "ok": true })),
            Err(e) => emit(&json!({
                "op": "resume",
                "project_id": project_id,
                "ok": false,
                "error": e.to_string(),
            })),
        },
        Op::Cancel { project_id } => {
            let cancelled = orchestrator.cancel(&project_id);
            emit(&json!({ "op": "cancel", "project_id": project_id, "ok": cancelled }));
        }
    }
}

fn print_events(bus: &EventBus) -> JoinHandle<()> {
    let mut subscription = bus.subscribe_all();
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            eprintln!(
                "[{}] {:?} {}: {}",
                event.project_id, event.priority, event.event_type, event.message
            );
        }
    })
}

pub async fn execute(args: WatchArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = super::load_config(config_path.as_ref(), &args.root)?;

    let runtime: Arc<dyn SandboxRuntime> = match args.runtime {
        RuntimeKind::Docker => Arc::new(
            DockerRuntime::new()
                .await
                .context("Docker runtime not available")?,
        ),
        RuntimeKind::Mock => Arc::new(MockRuntime::new()),
    };

    let bus = Arc::new(EventBus::new(config.events.clone()));
    if !args.no_journal {
        let journal = match &config.events.journal_dir {
            Some(dir) => EventJournal::new(dir),
            None => EventJournal::in_workspace(&args.root),
        };
        info!("Journaling events to {:?}", journal.dir());
        journal.spawn(bus.subscribe_all());
    }
    if args.events {
        print_events(&bus);
    }

    let lifecycle = Arc::new(
        SandboxLifecycleManager::new(runtime)
            .with_policy(StepPolicy::from_config(&config.sandbox))
            .with_events(Arc::clone(&bus)),
    );

    let mut proposers = ProposerRegistry::new();
    let command = &config.orchestrator.proposer_command;
    if command.is_empty() {
        warn!("No proposer_command configured, only deterministic fixes will run");
    } else {
        let proposer = CommandProposer::new(command.clone(), config.orchestrator.proposal_timeout())?;
        proposers = proposers.with_fallback(Arc::new(proposer));
    }

    let orchestrator = Arc::new(
        AutoFixOrchestrator::new(&config, Arc::clone(&lifecycle), Arc::clone(&bus))?
            .with_proposers(proposers),
    );

    for (id, dir) in &args.projects {
        let project_id = ProjectId::new(id.as_str());
        let spec = SandboxSpec::from_config(&config.sandbox, dir);
        let report = lifecycle
            .provision(&project_id, spec)
            .await
            .with_context(|| format!("Failed to provision sandbox for {}", id))?;
        info!("Provisioned {} ({})", project_id, report.overall);
        orchestrator.register_project(project_id, Arc::new(LocalFileStore::new(dir)));
    }

    info!("Watching {} project(s), reading reports from stdin", args.projects.len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Line>(line) {
                    Ok(Line::Op(op)) => run_op(&orchestrator, op),
                    Ok(Line::Report(report)) => {
                        let cycle = orchestrator.spawn_report(report);
                        in_flight.retain(|task| !task.is_finished());
                        in_flight.push(tokio::spawn(async move {
                            match cycle.await {
                                Ok(outcome) => emit(&outcome),
                                Err(e) => warn!("Fix cycle task failed: {}", e),
                            }
                        }));
                    }
                    Err(e) => {
                        warn!("Ignoring malformed line: {}", e);
                        emit(&json!({ "ok": false, "error": format!("malformed line: {}", e) }));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cancelling in-flight fixes");
                for project_id in orchestrator.projects() {
                    orchestrator.cancel(&project_id);
                }
                break;
            }
        }
    }

    for task in in_flight {
        if let Err(e) = task.await {
            warn!("Fix cycle task failed: {}", e);
        }
    }
    emit(&json!({ "op": "metrics", "metrics": orchestrator.get_metrics() }));

    if !args.keep {
        for project_id in orchestrator.projects() {
            if let Err(e) = lifecycle.stop(&project_id).await {
                warn!(project = %project_id, "Failed to stop sandbox: {}", e);
            }
        }
    }
    Ok(())
}
