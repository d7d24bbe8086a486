//! The build-fix-restart loop.
//!
//! One [`AutoFixOrchestrator`] serves every project in the process. Each
//! reported error runs one cycle: normalize, consult the cache, breaker and
//! limiter, classify, obtain a fix (rule, cache or proposer), apply it as one
//! batch, restart the sandbox and verify. The FixLoop machine of the project
//! is the single-flight guard; a report that finds it busy is turned away
//! without touching any budget.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use mend_core::{
    ErrorReport, Event, EventBus, EventPriority, EventType, FixLoopPhase, MachineSnapshot,
    MendConfig, OrchestratorConfig, Phase, ProjectId, ProjectPhase, StateMachine,
};
use mend_runner::{RestartReport, SandboxLifecycleManager};

use crate::breaker::{BreakerDecision, CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::cache::FixCache;
use crate::classifier::{Classifier, ClassifyContext, ErrorKind, RuleClassifier, UnknownPolicy};
use crate::error::{HealError, HealResult};
use crate::limiter::{RetryDecision, RetryLimiter, SessionUsage};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::normalize::Normalizer;
use crate::patch::{make_diff, PatchApplier};
use crate::plan::{FileChangeRequest, FixPlan, FixSource};
use crate::proposal::{FixRequest, ProposerRegistry, SourceFile};
use crate::record::{AttemptResult, ErrorRecord, FixAttempt, FixOutcome, FixStatus};
use crate::rules::RuleFixer;
use crate::store::FileStore;

/// Per-project state owned by the orchestrator.
struct ProjectSlot {
    project: StateMachine<ProjectPhase>,
    fix_loop: StateMachine<FixLoopPhase>,
    cancel: AtomicBool,
    /// Serializes claiming the fix loop against `cancel`.
    claim: Mutex<()>,
    store: Arc<dyn FileStore>,
    applier: PatchApplier,
    attempts: Mutex<Vec<FixAttempt>>,
}

impl ProjectSlot {
    fn new(store: Arc<dyn FileStore>, phase: ProjectPhase) -> Self {
        Self {
            project: StateMachine::starting_at(phase),
            fix_loop: StateMachine::new(),
            cancel: AtomicBool::new(false),
            claim: Mutex::new(()),
            applier: PatchApplier::new(Arc::clone(&store)),
            store,
            attempts: Mutex::new(Vec::new()),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Idle -> Detecting with a fresh cancel flag. A cancel either sees Idle
    /// or lands after the flag was cleared.
    fn claim(&self, reason: String) -> bool {
        let _gate = self.claim.lock();
        if self
            .fix_loop
            .transition_from(FixLoopPhase::Idle, FixLoopPhase::Detecting, reason)
            .is_err()
        {
            return false;
        }
        self.cancel.store(false, Ordering::Release);
        true
    }

    fn request_cancel(&self) -> Option<FixLoopPhase> {
        let _gate = self.claim.lock();
        let phase = self.fix_loop.current();
        if matches!(phase, FixLoopPhase::Idle | FixLoopPhase::Aborted) {
            return None;
        }
        self.cancel.store(true, Ordering::Release);
        Some(phase)
    }
}

/// Bookkeeping for one running cycle.
struct Cycle {
    project_id: ProjectId,
    hash: String,
    cache_key: String,
    started: Instant,
    /// Holds the breaker's half-open probe slot
    probe: bool,
    source: Option<FixSource>,
    tokens: u64,
    cost_usd: f64,
    /// Plan to store in the cache if the fix verifies
    cacheable: Option<FixPlan>,
}

/// Operator view of one project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSnapshot {
    pub project_id: ProjectId,
    pub phase: MachineSnapshot<ProjectPhase>,
    pub fix_loop: MachineSnapshot<FixLoopPhase>,
    pub circuit: CircuitSnapshot,
    pub usage: SessionUsage,
}

fn advance<P: Phase>(machine: &StateMachine<P>, to: P, reason: impl Into<String>) {
    if let Err(e) = machine.transition(to, reason) {
        warn!(error = %e, "Skipped state transition");
    }
}

fn ended(cycle: &Cycle, status: FixStatus, reason: impl Into<String>) -> FixOutcome {
    FixOutcome::new(cycle.project_id.clone(), cycle.hash.clone(), status).with_reason(reason)
}

/// Cache form of a plan: no base hashes, and whole-file replacements turned
/// into diffs against the content they replaced.
fn cacheable_plan(plan: &FixPlan, originals: &HashMap<String, Option<String>>) -> FixPlan {
    let changes = plan
        .changes
        .iter()
        .map(|change| match change {
            FileChangeRequest::Replace { path, content, .. } => {
                match originals.get(path).cloned().flatten() {
                    Some(original) => FileChangeRequest::diff(path, make_diff(&original, content)),
                    None => FileChangeRequest::create(path, content),
                }
            }
            other => other.clone().without_base_hash(),
        })
        .collect();
    FixPlan {
        changes,
        ..plan.clone()
    }
}

pub struct AutoFixOrchestrator {
    config: OrchestratorConfig,
    classifier: Arc<dyn Classifier>,
    rules: RuleFixer,
    proposers: ProposerRegistry,
    cache: Arc<FixCache>,
    limiter: Arc<RetryLimiter>,
    breaker: Arc<CircuitBreaker>,
    lifecycle: Arc<SandboxLifecycleManager>,
    events: Arc<EventBus>,
    normalizer: &'static Normalizer,
    metrics: Metrics,
    projects: RwLock<HashMap<ProjectId, Arc<ProjectSlot>>>,
}

impl AutoFixOrchestrator {
    pub fn new(
        config: &MendConfig,
        lifecycle: Arc<SandboxLifecycleManager>,
        events: Arc<EventBus>,
    ) -> HealResult<Self> {
        let policy = if config.orchestrator.allow_unknown_attempt {
            UnknownPolicy::AllowOneAttempt
        } else {
            UnknownPolicy::Deny
        };
        Ok(Self {
            config: config.orchestrator.clone(),
            classifier: Arc::new(RuleClassifier::new()?.with_unknown_policy(policy)),
            rules: RuleFixer::new(config.sandbox.preview_port),
            proposers: ProposerRegistry::new(),
            cache: Arc::new(FixCache::new(config.cache.clone())),
            limiter: Arc::new(RetryLimiter::new(config.limiter.clone())),
            breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            lifecycle,
            events,
            normalizer: Normalizer::global(),
            metrics: Metrics::new(),
            projects: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_proposers(mut self, proposers: ProposerRegistry) -> Self {
        self.proposers = proposers;
        self
    }

    pub fn with_rules(mut self, rules: RuleFixer) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<FixCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RetryLimiter> {
        &self.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn lifecycle(&self) -> &Arc<SandboxLifecycleManager> {
        &self.lifecycle
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // =========================================================================
    // Projects
    // =========================================================================

    /// Adopt a running project whose files live in `store`.
    pub fn register_project(&self, project_id: ProjectId, store: Arc<dyn FileStore>) {
        self.register_project_at(project_id, store, ProjectPhase::Running);
    }

    pub fn register_project_at(
        &self,
        project_id: ProjectId,
        store: Arc<dyn FileStore>,
        phase: ProjectPhase,
    ) {
        info!(project = %project_id, %phase, "Registered project");
        self.projects
            .write()
            .insert(project_id, Arc::new(ProjectSlot::new(store, phase)));
    }

    pub fn unregister_project(&self, project_id: &ProjectId) -> bool {
        self.projects.write().remove(project_id).is_some()
    }

    fn slot(&self, project_id: &ProjectId) -> Option<Arc<ProjectSlot>> {
        self.projects.read().get(project_id).cloned()
    }

    fn require_slot(&self, project_id: &ProjectId) -> HealResult<Arc<ProjectSlot>> {
        self.slot(project_id)
            .ok_or_else(|| HealError::UnknownProject(project_id.to_string()))
    }

    pub fn projects(&self) -> Vec<ProjectId> {
        let mut ids: Vec<ProjectId> = self.projects.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn project_phase(&self, project_id: &ProjectId) -> Option<ProjectPhase> {
        self.slot(project_id).map(|s| s.project.current())
    }

    pub fn fix_loop_phase(&self, project_id: &ProjectId) -> Option<FixLoopPhase> {
        self.slot(project_id).map(|s| s.fix_loop.current())
    }

    pub fn project_snapshot(&self, project_id: &ProjectId) -> Option<ProjectSnapshot> {
        let slot = self.slot(project_id)?;
        Some(ProjectSnapshot {
            project_id: project_id.clone(),
            phase: slot.project.snapshot(),
            fix_loop: slot.fix_loop.snapshot(),
            circuit: self.breaker.snapshot(project_id),
            usage: self.limiter.usage(project_id),
        })
    }

    /// Audit trail of fix attempts for a project.
    pub fn attempts(&self, project_id: &ProjectId) -> Vec<FixAttempt> {
        self.slot(project_id)
            .map(|s| s.attempts.lock().clone())
            .unwrap_or_default()
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    pub fn reset_circuit(&self, project_id: &ProjectId) {
        self.breaker.reset(project_id);
        self.emit(Event::status(project_id.clone(), "Circuit reset by operator"));
    }

    pub fn reset_budget(&self, project_id: &ProjectId) {
        self.limiter.reset_project(project_id);
        self.emit(Event::status(project_id.clone(), "Retry budget reset by operator"));
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.breaker.open_circuits().len(), self.cache.len())
    }

    /// Ask the in-flight cycle of a project to stop at its next checkpoint.
    /// Returns false when nothing is in flight.
    pub fn cancel(&self, project_id: &ProjectId) -> bool {
        let Some(slot) = self.slot(project_id) else {
            return false;
        };
        let Some(phase) = slot.request_cancel() else {
            return false;
        };
        info!(project = %project_id, %phase, "Cancellation requested");
        true
    }

    /// Bring an aborted project back: FixLoop to Idle, Project to Building.
    pub fn resume_project(&self, project_id: &ProjectId) -> HealResult<()> {
        let slot = self.require_slot(project_id)?;
        if slot.fix_loop.current() == FixLoopPhase::Aborted {
            slot.fix_loop.resume("operator resume")?;
        }
        if slot.project.is_terminal() {
            slot.project.resume("operator resume")?;
        }
        slot.cancel.store(false, Ordering::Release);
        self.emit(Event::status(project_id.clone(), "Project resumed by operator"));
        Ok(())
    }

    // =========================================================================
    // Fix cycle
    // =========================================================================

    /// Run one cycle on its own task.
    pub fn spawn_report(self: &Arc<Self>, report: ErrorReport) -> JoinHandle<FixOutcome> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.handle_report(report).await })
    }

    /// Run one full cycle for a reported error.
    pub async fn handle_report(&self, report: ErrorReport) -> FixOutcome {
        self.metrics.report_received();
        let project_id = report.project_id.clone();
        let hash = self.normalizer.hash(&report.message);

        let Some(slot) = self.slot(&project_id) else {
            return self.turn_away(
                FixOutcome::new(project_id, hash, FixStatus::Halted)
                    .with_reason("project not registered"),
            );
        };

        let loop_phase = slot.fix_loop.current();
        if !matches!(loop_phase, FixLoopPhase::Idle | FixLoopPhase::Aborted) {
            return self.turn_away(
                FixOutcome::new(project_id, hash, FixStatus::Busy)
                    .with_reason(format!("fix loop is {}", loop_phase)),
            );
        }
        let phase = slot.project.current();
        if !phase.accepts_reports() {
            return self.turn_away(
                FixOutcome::new(project_id, hash, FixStatus::Halted)
                    .with_reason(format!("project is {}", phase)),
            );
        }
        if !slot.claim(format!("error {}", hash)) {
            return self.turn_away(
                FixOutcome::new(project_id, hash, FixStatus::Busy)
                    .with_reason("fix already in flight"),
            );
        }

        advance(&slot.project, ProjectPhase::Fixing, format!("fixing {}", hash));

        let cache_key = self.cache.key(&hash, report.file_path.as_deref());
        let mut cycle = Cycle {
            project_id,
            hash,
            cache_key,
            started: Instant::now(),
            probe: false,
            source: None,
            tokens: 0,
            cost_usd: 0.0,
            cacheable: None,
        };

        info!(
            project = %cycle.project_id,
            error_hash = %cycle.hash,
            source = %report.source,
            "Error reported"
        );
        self.emit(
            Event::status(cycle.project_id.clone(), "Error received")
                .with_payload(json!({ "error_hash": cycle.hash, "source": report.source })),
        );

        let result = self.run_cycle(&slot, &report, &mut cycle).await;
        self.finish(&slot, &cycle, result)
    }

    async fn run_cycle(
        &self,
        slot: &ProjectSlot,
        report: &ErrorReport,
        cycle: &mut Cycle,
    ) -> FixOutcome {
        let cached = self.cache.get(&cycle.cache_key);
        self.metrics.cache_lookup(cached.is_some());

        // The breaker has the last word, cache hit or not.
        match self.breaker.check(&cycle.project_id) {
            BreakerDecision::Deny { reason } => {
                self.metrics.denied_by_breaker();
                return ended(cycle, FixStatus::Denied, reason);
            }
            decision => cycle.probe = decision.is_probe(),
        }

        let decision = match cached {
            Some(_) => self.limiter.can_reuse(&cycle.project_id, &cycle.hash),
            None => self.limiter.can_retry(&cycle.project_id, &cycle.hash),
        };
        if let RetryDecision::Deny { reason } = decision {
            self.metrics.denied_by_limiter();
            return ended(cycle, FixStatus::Denied, reason);
        }

        let plan = match cached {
            Some(fix) => {
                debug!(project = %cycle.project_id, key = %cycle.cache_key, "Cache hit");
                self.emit(
                    Event::status(cycle.project_id.clone(), "Reusing cached fix")
                        .with_payload(json!({ "key": cycle.cache_key, "success_rate": fix.success_rate })),
                );
                advance(&slot.fix_loop, FixLoopPhase::Fixing, "cache hit");
                FixPlan {
                    source: FixSource::Cache,
                    ..fix.plan
                }
            }
            None => {
                if slot.cancelled() {
                    return ended(cycle, FixStatus::Cancelled, "cancelled before classification");
                }

                advance(&slot.fix_loop, FixLoopPhase::Classifying, "classify");
                let context = ClassifyContext {
                    file_path: report.file_path.clone(),
                    framework: None,
                };
                let classification = self.classifier.classify(&report.message, &context);
                info!(
                    project = %cycle.project_id,
                    error_hash = %cycle.hash,
                    kind = %classification.kind,
                    category = %classification.category,
                    fixable = classification.fixable,
                    "Error classified"
                );
                self.emit(
                    Event::status(
                        cycle.project_id.clone(),
                        format!("Classified as {}", classification.category),
                    )
                    .with_payload(serde_json::to_value(&classification).unwrap_or_default()),
                );

                if !classification.fixable {
                    return ended(cycle, FixStatus::Unfixable, classification.hint.clone());
                }
                if classification.is_unknown()
                    && self.limiter.attempts_for(&cycle.project_id, &cycle.hash) > 0
                {
                    return ended(
                        cycle,
                        FixStatus::Unfixable,
                        "unknown error already had its one attempt",
                    );
                }

                let record = ErrorRecord::new(report, cycle.hash.clone(), classification);
                let plan = match self.obtain_fix(slot, &record, cycle).await {
                    Ok(plan) => plan,
                    Err(outcome) => return outcome,
                };
                advance(&slot.fix_loop, FixLoopPhase::Fixing, format!("fix from {}", plan.source));
                plan
            }
        };

        cycle.source = Some(plan.source);
        self.apply_and_verify(slot, plan, cycle).await
    }

    /// Deterministic rule first, then a bounded proposal.
    async fn obtain_fix(
        &self,
        slot: &ProjectSlot,
        record: &ErrorRecord,
        cycle: &mut Cycle,
    ) -> Result<FixPlan, FixOutcome> {
        let classification = &record.classification;
        match self
            .rules
            .fix(classification, &record.message, slot.store.as_ref())
        {
            Ok(Some(plan)) => return Ok(plan),
            Ok(None) => {}
            Err(e) => warn!(project = %cycle.project_id, error = %e, "Rule fix failed"),
        }

        if classification.kind == ErrorKind::Infrastructure {
            return Err(ended(
                cycle,
                FixStatus::NoFix,
                format!("no remediation for {}", classification.category),
            ));
        }
        let Some(proposer) = self.proposers.resolve(classification.kind) else {
            return Err(ended(
                cycle,
                FixStatus::NoFix,
                format!("no proposer for {} errors", classification.kind),
            ));
        };

        let budget = self
            .limiter
            .remaining_tokens(&cycle.project_id)
            .min(self.config.max_tokens_per_proposal);
        if budget == 0 {
            return Err(ended(cycle, FixStatus::Denied, "no token budget left for a proposal"));
        }
        if slot.cancelled() {
            return Err(ended(cycle, FixStatus::Cancelled, "cancelled before proposal"));
        }

        let request = FixRequest {
            project_id: cycle.project_id.clone(),
            error: record.clone(),
            files: self.relevant_files(slot, record),
            token_budget: budget,
            attempt: self.limiter.attempts_for(&cycle.project_id, &cycle.hash) + 1,
        };
        self.emit(
            Event::status(cycle.project_id.clone(), "Requesting fix proposal")
                .with_payload(json!({ "token_budget": budget, "files": request.files.len() })),
        );

        let limit = self.config.proposal_timeout();
        let proposal = match timeout(limit, proposer.propose(&request)).await {
            Err(_) => {
                return Err(ended(
                    cycle,
                    FixStatus::TimedOut,
                    format!("proposal timed out after {}s", limit.as_secs()),
                ))
            }
            Ok(Err(e)) => return Err(ended(cycle, FixStatus::NoFix, e.to_string())),
            Ok(Ok(proposal)) => proposal,
        };

        cycle.tokens += proposal.total_tokens();
        cycle.cost_usd += self
            .config
            .token_cost(proposal.input_tokens, proposal.output_tokens);

        if proposal.changes.is_empty() {
            return Err(ended(cycle, FixStatus::NoFix, "proposer returned no changes"));
        }
        let description = proposal
            .description
            .unwrap_or_else(|| format!("proposed fix for {}", classification.category));
        Ok(FixPlan::new(description, FixSource::Proposer).with_changes(proposal.changes))
    }

    fn relevant_files(&self, slot: &ProjectSlot, record: &ErrorRecord) -> Vec<SourceFile> {
        let paths: BTreeSet<&str> = record
            .file_path
            .as_deref()
            .into_iter()
            .chain(record.classification.details.file.as_deref())
            .collect();

        paths
            .into_iter()
            .filter_map(|path| match slot.store.read(path) {
                Ok(Some(content)) => Some(SourceFile {
                    path: path.to_string(),
                    content,
                }),
                _ => None,
            })
            .collect()
    }

    async fn apply_and_verify(
        &self,
        slot: &ProjectSlot,
        plan: FixPlan,
        cycle: &mut Cycle,
    ) -> FixOutcome {
        if slot.cancelled() {
            return ended(cycle, FixStatus::Cancelled, "cancelled before apply");
        }
        let project_id = cycle.project_id.clone();

        info!(
            project = %project_id,
            error_hash = %cycle.hash,
            source = %plan.source,
            changes = plan.changes.len(),
            actions = plan.actions.len(),
            "Applying fix"
        );

        let originals: HashMap<String, Option<String>> = plan
            .changes
            .iter()
            .filter(|c| matches!(c, FileChangeRequest::Replace { .. }))
            .map(|c| {
                let path = c.path().to_string();
                let original = slot.store.read(&path).ok().flatten();
                (path, original)
            })
            .collect();

        let mut files_changed = Vec::new();
        if !plan.changes.is_empty() {
            let patch = slot.applier.apply(&plan.changes);
            if !patch.applied {
                let reason = patch.reason().unwrap_or_else(|| "patch rejected".to_string());
                self.emit(
                    Event::error(project_id.clone(), format!("Patch rejected: {}", reason))
                        .with_payload(serde_json::to_value(&patch).unwrap_or_default()),
                );
                return ended(cycle, FixStatus::ApplyFailed, reason);
            }
            files_changed = patch.changed_files();
            for path in &files_changed {
                self.emit(
                    Event::new(EventType::FileOperation, project_id.clone(), format!("Updated {}", path))
                        .with_payload(json!({ "path": path })),
                );
            }
        }

        if !plan.actions.is_empty() {
            let failure = match self.lifecycle.remediate(&project_id, &plan.actions).await {
                Ok(reports) => reports.into_iter().find(|r| r.failed()).map(|r| {
                    format!(
                        "{} failed: {}",
                        r.step,
                        r.error.unwrap_or_else(|| "unknown error".to_string())
                    )
                }),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                let mut result = ended(cycle, FixStatus::ApplyFailed, reason);
                result.files_changed = files_changed;
                return result;
            }
        }

        if plan.source != FixSource::Cache && plan.source != FixSource::Remediation {
            cycle.cacheable = Some(cacheable_plan(&plan, &originals));
        }
        self.emit(
            Event::new(EventType::FixApplied, project_id.clone(), plan.description.clone())
                .with_payload(json!({
                    "source": plan.source,
                    "files": files_changed,
                    "actions": plan.actions,
                })),
        );

        let restart = match self.lifecycle.restart(&project_id).await {
            Ok(report) => report,
            Err(e) => {
                let mut result = ended(cycle, FixStatus::VerificationFailed, format!("restart failed: {}", e));
                result.files_changed = files_changed;
                return result;
            }
        };

        // a restart in progress always completes before a cancel is honoured
        let mut result = if slot.cancelled() {
            ended(cycle, FixStatus::Cancelled, "cancelled after restart")
        } else {
            advance(&slot.fix_loop, FixLoopPhase::Verifying, "verify");
            match self.verify(cycle, &restart).await {
                Ok(()) => FixOutcome::new(project_id, cycle.hash.clone(), FixStatus::Fixed),
                Err((status, reason)) => ended(cycle, status, reason),
            }
        };
        result.restart = Some(restart);
        result.files_changed = files_changed;
        result
    }

    /// A fix holds when the sandbox came up, the probe is healthy and the
    /// probe no longer reports the same error.
    async fn verify(&self, cycle: &Cycle, restart: &RestartReport) -> Result<(), (FixStatus, String)> {
        if !restart.sandbox_up() {
            return Err((
                FixStatus::VerificationFailed,
                format!("sandbox did not come up ({})", restart.overall),
            ));
        }

        let limit = self.config.verify_timeout();
        let probe = match self.lifecycle.probe(&cycle.project_id, limit).await {
            Ok(probe) => probe,
            Err(e) if e.is_timeout() => return Err((FixStatus::TimedOut, e.to_string())),
            Err(e) => return Err((FixStatus::VerificationFailed, e.to_string())),
        };

        let errors = probe.error_lines();
        if errors
            .iter()
            .any(|line| self.normalizer.hash(line) == cycle.hash)
        {
            return Err((FixStatus::VerificationFailed, "error still reported".to_string()));
        }
        if !probe.healthy {
            let detail = errors
                .first()
                .cloned()
                .unwrap_or_else(|| format!("exit code {}", probe.exit_code));
            return Err((
                FixStatus::VerificationFailed,
                format!("probe failed: {}", detail),
            ));
        }
        Ok(())
    }

    /// Record the outcome into cache, limiter and breaker.
    fn settle(&self, cycle: &Cycle, fixed: bool) {
        self.limiter
            .record_attempt(&cycle.project_id, &cycle.hash, cycle.tokens, fixed);
        if fixed {
            self.breaker.record_success(&cycle.project_id);
        } else {
            self.breaker.record_failure(&cycle.project_id);
        }

        match cycle.source {
            Some(FixSource::Cache) => {
                self.cache.report_outcome(&cycle.cache_key, fixed);
            }
            _ if fixed => {
                if let Some(plan) = &cycle.cacheable {
                    self.cache.set(&cycle.cache_key, plan.clone());
                }
            }
            _ => {}
        }
    }

    fn finish(&self, slot: &ProjectSlot, cycle: &Cycle, mut outcome: FixOutcome) -> FixOutcome {
        outcome.source = cycle.source;
        outcome.tokens = cycle.tokens;
        outcome.cost_usd = cycle.cost_usd;
        outcome.duration_ms = cycle.started.elapsed().as_millis() as u64;

        let attempted = outcome.status.attempted();
        if attempted {
            self.settle(cycle, outcome.is_fixed());
        } else if cycle.probe {
            self.breaker.release_probe(&cycle.project_id);
        }
        outcome.attempt = self.limiter.attempts_for(&cycle.project_id, &cycle.hash);

        let reason = outcome.reason.clone().unwrap_or_default();
        let landing = match outcome.status {
            FixStatus::Fixed => None,
            FixStatus::VerificationFailed | FixStatus::ApplyFailed | FixStatus::NoFix => {
                let budget_left = self
                    .limiter
                    .can_retry(&cycle.project_id, &cycle.hash)
                    .is_allowed()
                    && self.breaker.state(&cycle.project_id) == CircuitState::Closed;
                (!budget_left).then_some(ProjectPhase::Failed)
            }
            FixStatus::Cancelled => Some(ProjectPhase::Paused),
            _ => Some(ProjectPhase::Failed),
        };
        match landing {
            None => {
                advance(&slot.fix_loop, FixLoopPhase::Idle, outcome.status.to_string());
                advance(&slot.project, ProjectPhase::Running, outcome.status.to_string());
            }
            Some(phase) => {
                advance(&slot.fix_loop, FixLoopPhase::Aborted, reason.clone());
                advance(&slot.project, phase, reason.clone());
            }
        }
        slot.cancel.store(false, Ordering::Release);

        if attempted || outcome.status == FixStatus::Denied {
            slot.attempts.lock().push(FixAttempt {
                error_hash: cycle.hash.clone(),
                attempt: outcome.attempt,
                tokens: cycle.tokens,
                result: match outcome.status {
                    FixStatus::Fixed => AttemptResult::Success,
                    FixStatus::Denied => AttemptResult::Denied,
                    _ => AttemptResult::Fail,
                },
                source: cycle.source,
                cost_usd: cycle.cost_usd,
                timestamp: Utc::now(),
            });
        }

        if outcome.is_fixed() {
            info!(
                project = %cycle.project_id,
                error_hash = %cycle.hash,
                attempt = outcome.attempt,
                duration_ms = outcome.duration_ms,
                "Fix verified"
            );
        } else {
            warn!(
                project = %cycle.project_id,
                error_hash = %cycle.hash,
                attempt = outcome.attempt,
                status = %outcome.status,
                reason = %reason,
                "Fix cycle ended without a fix"
            );
        }

        self.metrics.record_outcome(&outcome);
        self.publish_outcome(&outcome);
        outcome
    }

    /// Terminate a report that never entered the loop.
    fn turn_away(&self, outcome: FixOutcome) -> FixOutcome {
        debug!(
            project = %outcome.project_id,
            status = %outcome.status,
            reason = outcome.reason.as_deref().unwrap_or_default(),
            "Report turned away"
        );
        self.metrics.record_outcome(&outcome);
        self.publish_outcome(&outcome);
        outcome
    }

    fn publish_outcome(&self, outcome: &FixOutcome) {
        let message = match &outcome.reason {
            Some(reason) => format!("{}: {}", outcome.status, reason),
            None => outcome.status.to_string(),
        };
        let priority = if outcome.is_fixed() {
            EventPriority::Normal
        } else {
            EventPriority::High
        };
        self.emit(
            Event::new(EventType::FixOutcome, outcome.project_id.clone(), message)
                .with_priority(priority)
                .with_payload(serde_json::to_value(outcome).unwrap_or_default()),
        );
    }

    fn emit(&self, event: Event) {
        if let Err(e) = self.events.publish(event) {
            debug!(error = %e, "Event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFileStore;

    fn slot() -> ProjectSlot {
        ProjectSlot::new(Arc::new(MemoryFileStore::new()), ProjectPhase::Running)
    }

    #[test]
    fn test_cancel_after_claim_is_kept() {
        let slot = slot();
        assert_eq!(slot.request_cancel(), None);

        assert!(slot.claim("error abc".into()));
        assert_eq!(slot.request_cancel(), Some(FixLoopPhase::Detecting));
        assert!(slot.cancelled());

        // a second report is turned away and must not clear the flag
        assert!(!slot.claim("error abc".into()));
        assert!(slot.cancelled());
    }

    #[test]
    fn test_claim_starts_with_fresh_flag() {
        let slot = slot();
        slot.cancel.store(true, Ordering::Release);
        assert!(slot.claim("error abc".into()));
        assert!(!slot.cancelled());
    }
}
