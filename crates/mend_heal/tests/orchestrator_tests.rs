//! Integration tests for the auto-fix loop.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;

use mend_core::{
    ErrorReport, EventBus, EventType, FixLoopPhase, MendConfig, ProjectId, ProjectPhase,
};
use mend_heal::{
    error_hash, AutoFixOrchestrator, FileChangeRequest, FileStore, FixPlan, FixProposer,
    FixRequest, FixSource, FixStatus, HealResult, MemoryFileStore, Proposal, ProposerRegistry,
};
use mend_runner::{MockRuntime, ProbeResult, SandboxLifecycleManager, SandboxSpec};

mock! {
    pub Proposer {}

    #[async_trait]
    impl FixProposer for Proposer {
        async fn propose(&self, request: &FixRequest) -> HealResult<Proposal>;
    }
}

const PAGE_PATH: &str = "src/app/page.tsx";
const PAGE: &str = "export default function Page({ items }) {\n  return <ul>{items.map((i) => <li>{i}</li>)}</ul>;\n}\n";
const FIXED_PAGE: &str = "export default function Page({ items = [] }) {\n  return <ul>{items.map((i) => <li>{i}</li>)}</ul>;\n}\n";
const NOT_A_FUNCTION: &str = "TypeError: items.map is not a function";

/// Proposer that takes a while to answer.
struct SlowProposer {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowProposer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FixProposer for SlowProposer {
    async fn propose(&self, _request: &FixRequest) -> HealResult<Proposal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Proposal::new(vec![FileChangeRequest::replace(PAGE_PATH, FIXED_PAGE)]).with_usage(1_200, 300))
    }
}

struct Harness {
    orchestrator: Arc<AutoFixOrchestrator>,
    runtime: MockRuntime,
    store: Arc<MemoryFileStore>,
    bus: Arc<EventBus>,
    project: ProjectId,
}

async fn harness_with(
    config: MendConfig,
    runtime: MockRuntime,
    proposer: Option<Arc<dyn FixProposer>>,
) -> Harness {
    let bus = Arc::new(EventBus::default());
    let lifecycle = Arc::new(
        SandboxLifecycleManager::new(Arc::new(runtime.clone())).with_events(Arc::clone(&bus)),
    );
    let project = ProjectId::from("todo");
    let spec = SandboxSpec::from_config(&config.sandbox, Path::new("/tmp/todo"));
    lifecycle.provision(&project, spec).await.unwrap();
    runtime.clear_calls();

    let store = Arc::new(
        MemoryFileStore::new()
            .with_file(PAGE_PATH, PAGE)
            .with_file(
                "package.json",
                "{\n  \"name\": \"todo\",\n  \"dependencies\": {\n    \"next\": \"14.1.0\"\n  }\n}\n",
            ),
    );

    let mut proposers = ProposerRegistry::new();
    if let Some(proposer) = proposer {
        proposers = proposers.with_fallback(proposer);
    }
    let orchestrator = AutoFixOrchestrator::new(&config, lifecycle, Arc::clone(&bus))
        .unwrap()
        .with_proposers(proposers);
    orchestrator.register_project(project.clone(), store.clone());

    Harness {
        orchestrator: Arc::new(orchestrator),
        runtime,
        store,
        bus,
        project,
    }
}

async fn harness(proposer: Option<Arc<dyn FixProposer>>) -> Harness {
    harness_with(MendConfig::default(), MockRuntime::new(), proposer).await
}

fn report(h: &Harness, message: &str) -> ErrorReport {
    ErrorReport::new(h.project.clone(), message).with_file(PAGE_PATH)
}

fn replacing_proposer(times: usize) -> MockProposer {
    let mut proposer = MockProposer::new();
    proposer.expect_propose().times(times).returning(|_| {
        Ok(Proposal::new(vec![FileChangeRequest::replace(PAGE_PATH, FIXED_PAGE)]).with_usage(2_000, 500))
    });
    proposer
}

#[tokio::test(start_paused = true)]
async fn test_rule_fix_is_applied_verified_and_cached() {
    let h = harness(None).await;

    let outcome = h
        .orchestrator
        .handle_report(ErrorReport::new(h.project.clone(), "Error: Cannot find module 'zod'"))
        .await;

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(outcome.source, Some(FixSource::Rule));
    assert_eq!(outcome.files_changed, vec!["package.json"]);
    assert!(outcome.restart.as_ref().unwrap().is_complete());
    assert!(h.store.get("package.json").unwrap().contains("\"zod\": \"latest\""));
    assert_eq!(
        h.runtime.call_sequence(),
        vec!["stop_preview", "stop_sandbox", "start_sandbox", "start_preview", "probe"]
    );
    assert_eq!(h.orchestrator.cache().len(), 1);
    assert_eq!(h.orchestrator.project_phase(&h.project), Some(ProjectPhase::Running));
    assert_eq!(h.orchestrator.fix_loop_phase(&h.project), Some(FixLoopPhase::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_same_error_on_another_line_hits_cache() {
    let h = harness(Some(Arc::new(replacing_proposer(1)))).await;
    let first = "TypeError: Cannot read properties of undefined (reading 'map') at line 42";
    let second = "TypeError: Cannot read properties of undefined (reading 'map') at line 58";
    assert_eq!(error_hash(first), error_hash(second));

    let outcome = h.orchestrator.handle_report(report(&h, first)).await;
    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(outcome.source, Some(FixSource::Proposer));
    assert_eq!(outcome.tokens, 2_500);
    assert!(outcome.cost_usd > 0.0);

    // the page regresses, same error on a different line
    h.store.write(PAGE_PATH, PAGE).unwrap();
    let outcome = h.orchestrator.handle_report(report(&h, second)).await;

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(outcome.source, Some(FixSource::Cache));
    assert_eq!(h.store.get(PAGE_PATH).as_deref(), Some(FIXED_PAGE));
    let metrics = h.orchestrator.get_metrics();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.fixes_succeeded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_fourth_attempt_on_same_error_is_denied() {
    let runtime = MockRuntime::new().add_probe_result(ProbeResult::unhealthy(1, NOT_A_FUNCTION));
    let h = harness_with(
        MendConfig::default(),
        runtime,
        Some(Arc::new(replacing_proposer(3))),
    )
    .await;

    for attempt in 1..=3 {
        let outcome = h.orchestrator.handle_report(report(&h, NOT_A_FUNCTION)).await;
        assert_eq!(outcome.status, FixStatus::VerificationFailed);
        assert_eq!(outcome.reason.as_deref(), Some("error still reported"));
        assert_eq!(outcome.attempt, attempt);
    }
    // budget for this error is spent
    assert_eq!(h.orchestrator.project_phase(&h.project), Some(ProjectPhase::Failed));

    let halted = h.orchestrator.handle_report(report(&h, NOT_A_FUNCTION)).await;
    assert_eq!(halted.status, FixStatus::Halted);

    h.orchestrator.resume_project(&h.project).unwrap();
    assert_eq!(h.orchestrator.project_phase(&h.project), Some(ProjectPhase::Building));

    let denied = h.orchestrator.handle_report(report(&h, NOT_A_FUNCTION)).await;
    assert_eq!(denied.status, FixStatus::Denied);
    assert_eq!(denied.reason.as_deref(), Some("already tried 3 times for this error"));
    assert_eq!(h.orchestrator.get_metrics().denied_limiter, 1);
    assert_eq!(h.orchestrator.attempts(&h.project).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cached_fix_respects_per_error_ceiling() {
    let runtime = MockRuntime::new().add_probe_result(ProbeResult::unhealthy(1, NOT_A_FUNCTION));
    let h = harness_with(MendConfig::default(), runtime, None).await;
    let key = h
        .orchestrator
        .cache()
        .key(&error_hash(NOT_A_FUNCTION), Some(PAGE_PATH));
    h.orchestrator.cache().set(
        &key,
        FixPlan::new("default items", FixSource::Proposer)
            .with_change(FileChangeRequest::replace(PAGE_PATH, FIXED_PAGE)),
    );

    for attempt in 1..=3 {
        let outcome = h.orchestrator.handle_report(report(&h, NOT_A_FUNCTION)).await;
        assert_eq!(outcome.status, FixStatus::VerificationFailed);
        assert_eq!(outcome.source, Some(FixSource::Cache));
        assert_eq!(outcome.attempt, attempt);
    }
    h.orchestrator.resume_project(&h.project).unwrap();

    let denied = h.orchestrator.handle_report(report(&h, NOT_A_FUNCTION)).await;
    assert_eq!(denied.status, FixStatus::Denied);
    assert_eq!(denied.reason.as_deref(), Some("already tried 3 times for this error"));
    assert_eq!(h.orchestrator.get_metrics().denied_limiter, 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_denies_even_on_cache_hit() {
    let h = harness(None).await;
    let message = "Error: Cannot find module 'zod'";
    h.orchestrator.cache().set(
        &error_hash(message),
        FixPlan::new("add zod", FixSource::Rule)
            .with_change(FileChangeRequest::create("zod.txt", "zod")),
    );
    for _ in 0..5 {
        h.orchestrator.breaker().record_failure(&h.project);
    }

    let outcome = h
        .orchestrator
        .handle_report(ErrorReport::new(h.project.clone(), message))
        .await;

    assert_eq!(outcome.status, FixStatus::Denied);
    assert_eq!(outcome.reason.as_deref(), Some("circuit open"));
    assert!(h.store.get("zod.txt").is_none());
    assert_eq!(h.orchestrator.project_phase(&h.project), Some(ProjectPhase::Failed));
    let metrics = h.orchestrator.get_metrics();
    assert_eq!((metrics.cache_hits, metrics.denied_breaker, metrics.open_circuits), (1, 1, 1));

    h.orchestrator.reset_circuit(&h.project);
    h.orchestrator.resume_project(&h.project).unwrap();
    let outcome = h
        .orchestrator
        .handle_report(ErrorReport::new(h.project.clone(), message))
        .await;
    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(outcome.source, Some(FixSource::Cache));
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_per_project() {
    let proposer = Arc::new(SlowProposer::new(Duration::from_secs(30)));
    let h = harness(Some(proposer.clone())).await;

    let in_flight = h.orchestrator.spawn_report(report(&h, NOT_A_FUNCTION));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.orchestrator.fix_loop_phase(&h.project), Some(FixLoopPhase::Classifying));

    let busy = h
        .orchestrator
        .handle_report(report(&h, "ReferenceError: foo is not defined"))
        .await;
    assert_eq!(busy.status, FixStatus::Busy);
    assert_eq!(h.orchestrator.limiter().usage(&h.project).attempts, 0);

    let outcome = in_flight.await.unwrap();
    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(proposer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.orchestrator.get_metrics().busy, 1);
}

#[tokio::test(start_paused = true)]
async fn test_proposal_watchdog_aborts_cycle() {
    let h = harness(Some(Arc::new(SlowProposer::new(Duration::from_secs(600))))).await;

    let outcome = h.orchestrator.handle_report(report(&h, NOT_A_FUNCTION)).await;

    assert_eq!(outcome.status, FixStatus::TimedOut);
    assert_eq!(h.orchestrator.fix_loop_phase(&h.project), Some(FixLoopPhase::Aborted));
    assert_eq!(h.orchestrator.project_phase(&h.project), Some(ProjectPhase::Failed));
    assert_eq!(h.store.get(PAGE_PATH).as_deref(), Some(PAGE));
    assert_eq!(h.orchestrator.get_metrics().timeouts, 1);

    h.orchestrator.resume_project(&h.project).unwrap();
    assert_eq!(h.orchestrator.fix_loop_phase(&h.project), Some(FixLoopPhase::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pauses_project() {
    let h = harness(Some(Arc::new(SlowProposer::new(Duration::from_secs(30))))).await;

    let in_flight = h.orchestrator.spawn_report(report(&h, NOT_A_FUNCTION));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.orchestrator.cancel(&h.project));

    let outcome = in_flight.await.unwrap();
    assert_eq!(outcome.status, FixStatus::Cancelled);
    assert_eq!(h.orchestrator.project_phase(&h.project), Some(ProjectPhase::Paused));
    assert_eq!(h.store.get(PAGE_PATH).as_deref(), Some(PAGE));
    assert!(!h.runtime.was_called("stop_preview"));
    assert!(!h.orchestrator.cancel(&h.project));
}

#[tokio::test(start_paused = true)]
async fn test_unfixable_error_never_reaches_proposer() {
    // no expectations: any call panics
    let h = harness(Some(Arc::new(MockProposer::new()))).await;

    let outcome = h
        .orchestrator
        .handle_report(report(&h, "npm ERR! getaddrinfo ENOTFOUND registry.npmjs.org"))
        .await;

    assert_eq!(outcome.status, FixStatus::Unfixable);
    assert_eq!(h.orchestrator.project_phase(&h.project), Some(ProjectPhase::Failed));
    assert_eq!(h.orchestrator.get_metrics().unfixable, 1);
}

#[tokio::test(start_paused = true)]
async fn test_port_conflict_is_remediated() {
    let h = harness(Some(Arc::new(MockProposer::new()))).await;

    let outcome = h
        .orchestrator
        .handle_report(ErrorReport::new(
            h.project.clone(),
            "Error: listen EADDRINUSE: address already in use :::3000",
        ))
        .await;

    assert_eq!(outcome.status, FixStatus::Fixed);
    assert_eq!(outcome.source, Some(FixSource::Remediation));
    let release = &h.runtime.get_method_calls("release_port")[0];
    assert_eq!(release.detail.as_deref(), Some("3000"));
    assert!(h.orchestrator.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_batch_leaves_files_untouched() {
    let mut proposer = MockProposer::new();
    proposer.expect_propose().times(1).returning(|_| {
        Ok(Proposal::new(vec![
            FileChangeRequest::replace(PAGE_PATH, FIXED_PAGE),
            FileChangeRequest::diff("package.json", "--- a/package.json\n+++ b/package.json\n@@ -1 +1 @@\n-nope\n+yes\n"),
        ]))
    });
    let h = harness(Some(Arc::new(proposer))).await;

    let outcome = h.orchestrator.handle_report(report(&h, NOT_A_FUNCTION)).await;

    assert_eq!(outcome.status, FixStatus::ApplyFailed);
    assert_eq!(h.store.get(PAGE_PATH).as_deref(), Some(PAGE));
    assert!(!h.runtime.was_called("stop_sandbox"));
    // budget remains, so the loop is ready for the next report
    assert_eq!(h.orchestrator.fix_loop_phase(&h.project), Some(FixLoopPhase::Idle));
    assert_eq!(h.orchestrator.project_phase(&h.project), Some(ProjectPhase::Running));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_error_gets_one_attempt_when_allowed() {
    let message = "flux capacitor error: misaligned";
    let mut config = MendConfig::default();
    config.orchestrator.allow_unknown_attempt = true;
    let runtime = MockRuntime::new().add_probe_result(ProbeResult::unhealthy(1, message));
    let h = harness_with(config, runtime, Some(Arc::new(replacing_proposer(1)))).await;

    let first = h.orchestrator.handle_report(report(&h, message)).await;
    assert_eq!(first.status, FixStatus::VerificationFailed);

    let second = h.orchestrator.handle_report(report(&h, message)).await;
    assert_eq!(second.status, FixStatus::Unfixable);
    assert_eq!(
        second.reason.as_deref(),
        Some("unknown error already had its one attempt")
    );
}

#[tokio::test(start_paused = true)]
async fn test_cycle_publishes_events() {
    let h = harness(None).await;
    let mut sub = h.bus.subscribe(&h.project);

    h.orchestrator
        .handle_report(ErrorReport::new(h.project.clone(), "Error: Cannot find module 'zod'"))
        .await;

    let mut types = Vec::new();
    while let Some(event) = sub.try_recv() {
        types.push(event.event_type);
    }
    for expected in [
        EventType::Status,
        EventType::FileOperation,
        EventType::FixApplied,
        EventType::RestartComplete,
        EventType::FixOutcome,
    ] {
        assert!(types.contains(&expected), "missing {} in {:?}", expected, types);
    }
    let history = h.bus.history(&h.project);
    assert_eq!(history.last().unwrap().event_type, EventType::FixOutcome);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_project_is_halted() {
    let h = harness(None).await;
    let outcome = h
        .orchestrator
        .handle_report(ErrorReport::new("ghost", "Error: Cannot find module 'zod'"))
        .await;
    assert_eq!(outcome.status, FixStatus::Halted);
    assert_eq!(h.orchestrator.get_metrics().halted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_projects_run_concurrently() {
    let h = harness(Some(Arc::new(SlowProposer::new(Duration::from_secs(30))))).await;
    let blog = ProjectId::from("blog");
    let spec = SandboxSpec::from_config(&MendConfig::default().sandbox, Path::new("/tmp/blog"));
    h.orchestrator.lifecycle().provision(&blog, spec).await.unwrap();
    h.orchestrator
        .register_project(blog.clone(), Arc::new(MemoryFileStore::new().with_file(PAGE_PATH, PAGE)));

    let a = h.orchestrator.spawn_report(report(&h, NOT_A_FUNCTION));
    let b = h
        .orchestrator
        .spawn_report(ErrorReport::new(blog.clone(), NOT_A_FUNCTION).with_file(PAGE_PATH));

    assert_eq!(a.await.unwrap().status, FixStatus::Fixed);
    assert_eq!(b.await.unwrap().status, FixStatus::Fixed);
    assert_eq!(h.orchestrator.get_metrics().busy, 0);
}
