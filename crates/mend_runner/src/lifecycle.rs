//! Per-project sandbox lifecycle.
//!
//! The manager exclusively owns every project's sandbox handle together with
//! its sandbox and preview state machines. Operations on one project are
//! serialized by an async lock; different projects proceed independently.
//!
//! Each lifecycle step runs under the step timeout and is retried a fixed
//! number of times. A failed step is recorded in the report and later steps
//! still run unless they depend on it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use mend_core::{
    Event, EventBus, EventPriority, EventType, Phase, PreviewPhase, ProjectId, SandboxStatus,
    StateMachine,
};

use crate::config::{SandboxSpec, StepPolicy};
use crate::error::{RunnerError, RunnerResult};
use crate::runtime::{PortMapping, ProbeResult, RemediationAction, SandboxInstance, SandboxRuntime};

/// A unit of lifecycle work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    CreateSandbox,
    StartSandbox,
    StopPreview,
    StopSandbox,
    StartPreview,
    Notify,
    ReleasePort,
    Cleanup,
    DestroySandbox,
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateSandbox => "create_sandbox",
            Self::StartSandbox => "start_sandbox",
            Self::StopPreview => "stop_preview",
            Self::StopSandbox => "stop_sandbox",
            Self::StartPreview => "start_preview",
            Self::Notify => "notify",
            Self::ReleasePort => "release_port",
            Self::Cleanup => "cleanup",
            Self::DestroySandbox => "destroy_sandbox",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: LifecycleStep,
    pub status: StepStatus,
    pub attempts: u32,
    /// Last error, or why the step was skipped
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepReport {
    fn skipped(step: LifecycleStep, reason: impl Into<String>) -> Self {
        Self {
            step,
            status: StepStatus::Skipped,
            attempts: 0,
            error: Some(reason.into()),
            duration_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// Overall verdict of a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartOutcome {
    /// Every step succeeded or was legitimately skipped
    Complete,
    /// The sandbox is up but some step failed
    Partial,
    /// The sandbox did not come up
    Failed,
}

impl fmt::Display for RestartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-step breakdown of a provision or restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartReport {
    pub project_id: ProjectId,
    pub steps: Vec<StepReport>,
    pub overall: RestartOutcome,
    pub duration_ms: u64,
}

impl RestartReport {
    fn new(project_id: ProjectId, steps: Vec<StepReport>, sandbox_up: bool, elapsed: Duration) -> Self {
        let mut report = Self {
            project_id,
            steps,
            overall: RestartOutcome::Failed,
            duration_ms: elapsed.as_millis() as u64,
        };
        report.overall = report.evaluate(sandbox_up);
        report
    }

    fn evaluate(&self, sandbox_up: bool) -> RestartOutcome {
        if !sandbox_up {
            RestartOutcome::Failed
        } else if self.steps.iter().any(StepReport::failed) {
            RestartOutcome::Partial
        } else {
            RestartOutcome::Complete
        }
    }

    pub fn is_complete(&self) -> bool {
        self.overall == RestartOutcome::Complete
    }

    /// Whether the sandbox came up.
    pub fn sandbox_up(&self) -> bool {
        self.overall != RestartOutcome::Failed
    }

    pub fn step(&self, step: LifecycleStep) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn failed_steps(&self) -> Vec<LifecycleStep> {
        self.steps.iter().filter(|s| s.failed()).map(|s| s.step).collect()
    }
}

/// Point-in-time view of a project's sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub project_id: ProjectId,
    pub instance_id: Option<String>,
    pub name: Option<String>,
    pub ports: Vec<PortMapping>,
    pub status: SandboxStatus,
    pub preview: PreviewPhase,
}

struct ManagedSandbox {
    spec: SandboxSpec,
    instance: RwLock<Option<SandboxInstance>>,
    status: StateMachine<SandboxStatus>,
    preview: StateMachine<PreviewPhase>,
    op_lock: tokio::sync::Mutex<()>,
}

impl ManagedSandbox {
    fn new(spec: SandboxSpec) -> Self {
        Self {
            spec,
            instance: RwLock::new(None),
            status: StateMachine::new(),
            preview: StateMachine::new(),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn instance_id(&self) -> Option<String> {
        self.instance.read().as_ref().map(|i| i.instance_id.clone())
    }
}

/// Move `machine` to `to`, logging instead of failing when the table forbids it.
fn advance<P: Phase>(machine: &StateMachine<P>, to: P, reason: &str) {
    if let Err(e) = machine.transition(to, reason) {
        warn!("{}", e);
    }
}

/// Owns every project's sandbox and drives its lifecycle through a runtime.
pub struct SandboxLifecycleManager {
    runtime: Arc<dyn SandboxRuntime>,
    policy: StepPolicy,
    events: Option<Arc<EventBus>>,
    sandboxes: RwLock<HashMap<ProjectId, Arc<ManagedSandbox>>>,
}

impl SandboxLifecycleManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            runtime,
            policy: StepPolicy::default(),
            events: None,
            sandboxes: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: StepPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publish `restart_complete` events to this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    pub fn policy(&self) -> StepPolicy {
        self.policy
    }

    fn get(&self, project_id: &ProjectId) -> RunnerResult<Arc<ManagedSandbox>> {
        self.sandboxes
            .read()
            .get(project_id)
            .cloned()
            .ok_or_else(|| RunnerError::SandboxNotFound(project_id.to_string()))
    }

    pub fn handle(&self, project_id: &ProjectId) -> Option<SandboxHandle> {
        let sandbox = self.sandboxes.read().get(project_id).cloned()?;
        let instance = sandbox.instance.read().clone();
        Some(SandboxHandle {
            project_id: project_id.clone(),
            instance_id: instance.as_ref().map(|i| i.instance_id.clone()),
            name: instance.as_ref().map(|i| i.name.clone()),
            ports: instance.map(|i| i.ports).unwrap_or_default(),
            status: sandbox.status.current(),
            preview: sandbox.preview.current(),
        })
    }

    pub fn projects(&self) -> Vec<ProjectId> {
        let mut projects: Vec<ProjectId> = self.sandboxes.read().keys().cloned().collect();
        projects.sort();
        projects
    }

    /// Run `op` under the step policy.
    async fn run_step<T, F, Fut>(
        &self,
        project_id: &ProjectId,
        step: LifecycleStep,
        mut op: F,
    ) -> (StepReport, Option<T>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RunnerResult<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match timeout(self.policy.timeout, op()).await {
                Ok(Ok(value)) => {
                    debug!(project = %project_id, %step, attempt, "lifecycle step succeeded");
                    let report = StepReport {
                        step,
                        status: StepStatus::Succeeded,
                        attempts: attempt,
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                    return (report, Some(value));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {} ms", self.policy.timeout.as_millis())
                }
            }
            warn!(project = %project_id, %step, attempt, "lifecycle step failed: {}", last_error);
            if attempt < max_attempts {
                sleep(self.policy.retry_delay).await;
            }
        }

        let report = StepReport {
            step,
            status: StepStatus::Failed,
            attempts: max_attempts,
            error: Some(last_error),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        (report, None)
    }

    /// Create and start a project's sandbox and preview.
    ///
    /// A project that already has a live sandbox is restarted instead.
    pub async fn provision(
        &self,
        project_id: &ProjectId,
        spec: SandboxSpec,
    ) -> RunnerResult<RestartReport> {
        let existing = self.sandboxes.read().get(project_id).cloned();
        if let Some(sandbox) = existing {
            if !sandbox.status.is_terminal() && sandbox.instance_id().is_some() {
                return self.restart(project_id).await;
            }
        }

        let sandbox = Arc::new(ManagedSandbox::new(spec));
        self.sandboxes
            .write()
            .insert(project_id.clone(), Arc::clone(&sandbox));
        let _guard = sandbox.op_lock.lock().await;

        info!(project = %project_id, image = %sandbox.spec.full_image(), "Provisioning sandbox");
        let started = Instant::now();
        let mut steps = Vec::new();

        advance(&sandbox.status, SandboxStatus::Creating, "provision");
        let runtime = &self.runtime;
        let spec = &sandbox.spec;
        let (create, instance) = self
            .run_step(project_id, LifecycleStep::CreateSandbox, move || {
                runtime.create_sandbox(project_id, spec)
            })
            .await;
        steps.push(create);

        let sandbox_up = match instance {
            Some(instance) => {
                *sandbox.instance.write() = Some(instance);
                let start = self.start_sandbox_step(project_id, &sandbox).await;
                let up = start.succeeded();
                steps.push(start);
                up
            }
            None => {
                advance(&sandbox.status, SandboxStatus::Error, "create failed");
                steps.push(StepReport::skipped(
                    LifecycleStep::StartSandbox,
                    "sandbox was not created",
                ));
                false
            }
        };

        steps.push(self.start_preview_or_skip(project_id, &sandbox, sandbox_up).await);
        Ok(self.finish(project_id, steps, sandbox_up, started.elapsed()))
    }

    /// Stop preview, stop sandbox, start sandbox, start preview, notify.
    pub async fn restart(&self, project_id: &ProjectId) -> RunnerResult<RestartReport> {
        let sandbox = self.get(project_id)?;
        let _guard = sandbox.op_lock.lock().await;
        if sandbox.status.is_terminal() || sandbox.instance_id().is_none() {
            return Err(RunnerError::SandboxNotFound(project_id.to_string()));
        }

        info!(project = %project_id, "Restarting sandbox");
        let started = Instant::now();
        let mut steps = Vec::new();

        steps.push(self.stop_preview_step(project_id, &sandbox).await);
        steps.push(self.stop_sandbox_step(project_id, &sandbox).await);
        let start = self.start_sandbox_step(project_id, &sandbox).await;
        let sandbox_up = start.succeeded();
        steps.push(start);
        steps.push(self.start_preview_or_skip(project_id, &sandbox, sandbox_up).await);

        Ok(self.finish(project_id, steps, sandbox_up, started.elapsed()))
    }

    /// Stop preview and sandbox without restarting.
    pub async fn stop(&self, project_id: &ProjectId) -> RunnerResult<Vec<StepReport>> {
        let sandbox = self.get(project_id)?;
        let _guard = sandbox.op_lock.lock().await;
        Ok(vec![
            self.stop_preview_step(project_id, &sandbox).await,
            self.stop_sandbox_step(project_id, &sandbox).await,
        ])
    }

    /// Remove a project's sandbox. The handle is dropped even if the runtime call failed.
    pub async fn destroy(&self, project_id: &ProjectId) -> RunnerResult<StepReport> {
        let sandbox = self.get(project_id)?;
        let _guard = sandbox.op_lock.lock().await;

        let report = match sandbox.instance_id() {
            Some(instance_id) => {
                let runtime = &self.runtime;
                let id = instance_id.as_str();
                self.run_step(project_id, LifecycleStep::DestroySandbox, move || {
                    runtime.destroy_sandbox(id)
                })
                .await
                .0
            }
            None => StepReport::skipped(LifecycleStep::DestroySandbox, "sandbox was never created"),
        };

        if sandbox.status.current() == SandboxStatus::Creating {
            advance(&sandbox.status, SandboxStatus::Error, "destroy");
        }
        advance(&sandbox.status, SandboxStatus::Terminated, "destroy");
        self.sandboxes.write().remove(project_id);
        info!(project = %project_id, "Sandbox destroyed");
        Ok(report)
    }

    /// Run deterministic infrastructure remediation inside a project's sandbox.
    pub async fn remediate(
        &self,
        project_id: &ProjectId,
        actions: &[RemediationAction],
    ) -> RunnerResult<Vec<StepReport>> {
        let sandbox = self.get(project_id)?;
        let _guard = sandbox.op_lock.lock().await;
        let instance_id = sandbox
            .instance_id()
            .ok_or_else(|| RunnerError::SandboxNotFound(project_id.to_string()))?;

        let runtime = &self.runtime;
        let id = instance_id.as_str();
        let spec = &sandbox.spec;
        let mut reports = Vec::with_capacity(actions.len());
        for action in actions {
            info!(project = %project_id, %action, "Remediating");
            let report = match action {
                RemediationAction::ReleasePort { port } => {
                    let port = *port;
                    self.run_step(project_id, LifecycleStep::ReleasePort, move || {
                        runtime.release_port(id, port)
                    })
                    .await
                    .0
                }
                RemediationAction::Cleanup => {
                    self.run_step(project_id, LifecycleStep::Cleanup, move || runtime.cleanup(id, spec))
                        .await
                        .0
                }
            };
            reports.push(report);
        }
        Ok(reports)
    }

    /// Run the build/boot check. A sandbox that is not running is reported unhealthy.
    pub async fn probe(&self, project_id: &ProjectId, limit: Duration) -> RunnerResult<ProbeResult> {
        let sandbox = self.get(project_id)?;
        let _guard = sandbox.op_lock.lock().await;

        let status = sandbox.status.current();
        let instance_id = match sandbox.instance_id() {
            Some(id) if status == SandboxStatus::Running => id,
            _ => {
                return Ok(ProbeResult::unhealthy(
                    -1,
                    format!("sandbox is {}", status),
                ))
            }
        };

        match timeout(limit, self.runtime.probe(&instance_id, &sandbox.spec)).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout {
                operation: "probe".to_string(),
                millis: limit.as_millis() as u64,
            }),
        }
    }

    async fn stop_preview_step(&self, project_id: &ProjectId, sandbox: &ManagedSandbox) -> StepReport {
        let phase = sandbox.preview.current();
        let instance_id = match sandbox.instance_id() {
            Some(id) if phase != PreviewPhase::Stopped => id,
            _ => return StepReport::skipped(LifecycleStep::StopPreview, "preview not running"),
        };

        match phase {
            PreviewPhase::Ready => advance(&sandbox.preview, PreviewPhase::Stopping, "stop"),
            PreviewPhase::Starting => advance(&sandbox.preview, PreviewPhase::Crashed, "stop while starting"),
            _ => {}
        }

        let runtime = &self.runtime;
        let id = instance_id.as_str();
        let spec = &sandbox.spec;
        let (report, _) = self
            .run_step(project_id, LifecycleStep::StopPreview, move || runtime.stop_preview(id, spec))
            .await;

        if report.succeeded() {
            advance(&sandbox.preview, PreviewPhase::Stopped, "stopped");
        } else if sandbox.preview.current() == PreviewPhase::Stopping {
            advance(&sandbox.preview, PreviewPhase::Crashed, "stop failed");
        }
        report
    }

    async fn stop_sandbox_step(&self, project_id: &ProjectId, sandbox: &ManagedSandbox) -> StepReport {
        let instance_id = match sandbox.instance_id() {
            Some(id) if sandbox.status.current() == SandboxStatus::Running => id,
            _ => return StepReport::skipped(LifecycleStep::StopSandbox, "sandbox not running"),
        };

        let runtime = &self.runtime;
        let id = instance_id.as_str();
        let (report, _) = self
            .run_step(project_id, LifecycleStep::StopSandbox, move || runtime.stop_sandbox(id))
            .await;

        if report.succeeded() {
            advance(&sandbox.status, SandboxStatus::Stopped, "stopped");
        } else {
            advance(&sandbox.status, SandboxStatus::Error, "stop failed");
        }
        report
    }

    async fn start_sandbox_step(&self, project_id: &ProjectId, sandbox: &ManagedSandbox) -> StepReport {
        let instance_id = match sandbox.instance_id() {
            Some(id) => id,
            None => return StepReport::skipped(LifecycleStep::StartSandbox, "sandbox was not created"),
        };
        if sandbox.status.current() != SandboxStatus::Creating {
            advance(&sandbox.status, SandboxStatus::Creating, "start");
        }

        let runtime = &self.runtime;
        let id = instance_id.as_str();
        let (report, ports) = self
            .run_step(project_id, LifecycleStep::StartSandbox, move || runtime.start_sandbox(id))
            .await;

        match ports {
            Some(ports) => {
                if !ports.is_empty() {
                    if let Some(instance) = sandbox.instance.write().as_mut() {
                        instance.ports = ports;
                    }
                }
                advance(&sandbox.status, SandboxStatus::Running, "started");
            }
            None => advance(&sandbox.status, SandboxStatus::Error, "start failed"),
        }
        report
    }

    async fn start_preview_or_skip(
        &self,
        project_id: &ProjectId,
        sandbox: &ManagedSandbox,
        sandbox_up: bool,
    ) -> StepReport {
        if !sandbox_up {
            return StepReport::skipped(LifecycleStep::StartPreview, "sandbox did not start");
        }
        let instance_id = match sandbox.instance_id() {
            Some(id) => id,
            None => return StepReport::skipped(LifecycleStep::StartPreview, "sandbox was not created"),
        };

        advance(&sandbox.preview, PreviewPhase::Starting, "start");
        let runtime = &self.runtime;
        let id = instance_id.as_str();
        let spec = &sandbox.spec;
        let (report, _) = self
            .run_step(project_id, LifecycleStep::StartPreview, move || runtime.start_preview(id, spec))
            .await;

        if report.succeeded() {
            advance(&sandbox.preview, PreviewPhase::Ready, "preview up");
        } else {
            advance(&sandbox.preview, PreviewPhase::Crashed, "preview failed");
        }
        report
    }

    /// Append the notify step and publish the report.
    fn finish(
        &self,
        project_id: &ProjectId,
        steps: Vec<StepReport>,
        sandbox_up: bool,
        elapsed: Duration,
    ) -> RestartReport {
        let mut report = RestartReport::new(project_id.clone(), steps, sandbox_up, elapsed);

        let notify = match &self.events {
            Some(events) => {
                let priority = if report.overall == RestartOutcome::Failed {
                    EventPriority::High
                } else {
                    EventPriority::Normal
                };
                let payload = serde_json::to_value(&report).unwrap_or_default();
                let event = Event::new(
                    EventType::RestartComplete,
                    project_id.clone(),
                    format!("restart {}", report.overall),
                )
                .with_payload(payload)
                .with_priority(priority);
                match events.publish(event) {
                    Ok(_) => StepReport {
                        step: LifecycleStep::Notify,
                        status: StepStatus::Succeeded,
                        attempts: 1,
                        error: None,
                        duration_ms: 0,
                    },
                    Err(e) => StepReport {
                        step: LifecycleStep::Notify,
                        status: StepStatus::Failed,
                        attempts: 1,
                        error: Some(e.to_string()),
                        duration_ms: 0,
                    },
                }
            }
            None => StepReport::skipped(LifecycleStep::Notify, "no event bus attached"),
        };

        report.steps.push(notify);
        report.overall = report.evaluate(sandbox_up);
        info!(
            project = %project_id,
            overall = %report.overall,
            duration_ms = report.duration_ms,
            "Lifecycle operation finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(step: LifecycleStep, status: StepStatus) -> StepReport {
        StepReport {
            step,
            status,
            attempts: 1,
            error: None,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_report_overall() {
        let project = ProjectId::from("p");
        let complete = RestartReport::new(
            project.clone(),
            vec![
                step(LifecycleStep::StopPreview, StepStatus::Skipped),
                step(LifecycleStep::StartSandbox, StepStatus::Succeeded),
            ],
            true,
            Duration::ZERO,
        );
        assert!(complete.is_complete());

        let partial = RestartReport::new(
            project.clone(),
            vec![
                step(LifecycleStep::StopPreview, StepStatus::Failed),
                step(LifecycleStep::StartSandbox, StepStatus::Succeeded),
            ],
            true,
            Duration::ZERO,
        );
        assert_eq!(partial.overall, RestartOutcome::Partial);
        assert_eq!(partial.failed_steps(), vec![LifecycleStep::StopPreview]);

        let failed = RestartReport::new(
            project,
            vec![step(LifecycleStep::StartSandbox, StepStatus::Failed)],
            false,
            Duration::ZERO,
        );
        assert!(!failed.sandbox_up());
    }
}
