//! # mend_heal
//!
//! The autonomous fix loop for Mender.
//!
//! Errors reported by build and runtime watchers are normalized, classified
//! and, within retry and circuit-breaker budgets, fixed: by a deterministic
//! rule, by a fix that worked before, or by a bounded call to an external
//! proposer. Fixes are applied as atomic batches, the sandbox is restarted and
//! the result is verified before anything is recorded as fixed.
//!
//! # Components
//!
//! - **Normalization**: volatile details stripped, short stable hash
//! - **Classifier**: ordered first-match rule table
//! - **FixCache**: TTL + LRU, success-rate decay
//! - **RetryLimiter**: per-session and per-error attempt and token budgets
//! - **CircuitBreaker**: per-project failure streaks with a half-open probe
//! - **PatchApplier**: staged, all-or-nothing file edits over a `FileStore`
//! - **AutoFixOrchestrator**: composes the above with the sandbox lifecycle
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mend_core::{ErrorReport, EventBus, MendConfig, ProjectId};
//! use mend_heal::{AutoFixOrchestrator, LocalFileStore};
//! use mend_runner::{MockRuntime, SandboxLifecycleManager};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MendConfig::default();
//! let lifecycle = Arc::new(SandboxLifecycleManager::new(Arc::new(MockRuntime::new())));
//! let orchestrator = AutoFixOrchestrator::new(&config, lifecycle, Arc::new(EventBus::default()))?;
//!
//! let project = ProjectId::from("todo-app");
//! orchestrator.register_project(project.clone(), Arc::new(LocalFileStore::new("./todo-app")));
//!
//! let outcome = orchestrator
//!     .handle_report(ErrorReport::new(project, "Error: Cannot find module 'zod'"))
//!     .await;
//! println!("{}", outcome.status);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod cache;
pub mod classifier;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod patch;
pub mod plan;
pub mod proposal;
pub mod record;
pub mod rules;
pub mod store;

pub use breaker::{BreakerDecision, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use cache::{CacheStats, CachedFix, FixCache};
pub use classifier::{
    Classification, Classifier, ClassifyContext, ErrorCategory, ErrorDetails, ErrorKind,
    RuleClassifier, RuleSpec, UnknownPolicy, BUILTIN_RULES,
};
pub use error::{HealError, HealResult};
pub use limiter::{RetryDecision, RetryLimiter, SessionUsage};
pub use metrics::{Metrics, MetricsSnapshot};
pub use normalize::{error_hash, normalize, Normalizer};
pub use orchestrator::{AutoFixOrchestrator, ProjectSnapshot};
pub use patch::{apply_unified_diff, make_diff, FileResult, FileStatus, PatchApplier, PatchOutcome};
pub use plan::{FileChangeRequest, FixPlan, FixSource};
pub use proposal::{
    parse_fix_response, CommandProposer, FixProposer, FixRequest, Proposal, ProposerRegistry,
    SourceFile,
};
pub use record::{AttemptResult, ErrorRecord, FixAttempt, FixOutcome, FixStatus};
pub use rules::RuleFixer;
pub use store::{validate_relative_path, FileStore, LocalFileStore, MemoryFileStore};
