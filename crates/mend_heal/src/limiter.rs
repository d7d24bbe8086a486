//! Attempt and token budgets per project session and per error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use mend_core::{LimiterConfig, ProjectId, ShardedMap};

/// Result of a budget check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    Allow,
    Deny { reason: String },
}

impl RetryDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny { reason } => Some(reason),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ErrorBudget {
    attempts: u32,
    fixed: bool,
}

#[derive(Debug)]
struct Session {
    started: Instant,
    attempts: u32,
    tokens: u64,
    per_error: HashMap<String, ErrorBudget>,
}

impl Session {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            attempts: 0,
            tokens: 0,
            per_error: HashMap::new(),
        }
    }
}

/// Usage of one project's session, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub attempts: u32,
    pub tokens: u64,
    pub errors_tracked: usize,
    pub errors_fixed: usize,
}

pub struct RetryLimiter {
    config: LimiterConfig,
    sessions: ShardedMap<ProjectId, Session>,
}

impl Default for RetryLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

impl RetryLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let sessions = ShardedMap::new(config.shards);
        Self { config, sessions }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Run `f` on the project's session, starting a fresh one if the current
    /// session outlived its TTL.
    fn with_session<R>(&self, project_id: &ProjectId, f: impl FnOnce(&mut Session) -> R) -> R {
        let ttl = self.config.session_ttl();
        self.sessions
            .with_entry(project_id.clone(), Session::new, |session| {
                if session.started.elapsed() >= ttl {
                    debug!(project = %project_id, "Retry session expired, starting a new one");
                    *session = Session::new();
                }
                f(session)
            })
    }

    pub fn can_retry(&self, project_id: &ProjectId, error_hash: &str) -> RetryDecision {
        self.check(project_id, error_hash, true)
    }

    /// Ceilings only. A fix that already worked may be reapplied when its
    /// error comes back.
    pub fn can_reuse(&self, project_id: &ProjectId, error_hash: &str) -> RetryDecision {
        self.check(project_id, error_hash, false)
    }

    fn check(&self, project_id: &ProjectId, error_hash: &str, deny_fixed: bool) -> RetryDecision {
        let config = &self.config;
        self.with_session(project_id, |session| {
            if session.attempts >= config.max_retries_per_session {
                return RetryDecision::deny(format!(
                    "session attempt limit reached ({})",
                    config.max_retries_per_session
                ));
            }
            if session.tokens >= config.max_tokens_per_session {
                return RetryDecision::deny(format!(
                    "session token budget exhausted ({})",
                    config.max_tokens_per_session
                ));
            }
            if let Some(budget) = session.per_error.get(error_hash) {
                if budget.attempts >= config.max_retries_per_error {
                    return RetryDecision::deny(format!(
                        "already tried {} times for this error",
                        budget.attempts
                    ));
                }
                if deny_fixed && budget.fixed {
                    return RetryDecision::deny("error already fixed this session");
                }
            }
            RetryDecision::Allow
        })
    }

    /// Count one attempt. All counters move together under the shard lock.
    pub fn record_attempt(&self, project_id: &ProjectId, error_hash: &str, tokens: u64, fixed: bool) {
        self.with_session(project_id, |session| {
            session.attempts += 1;
            session.tokens = session.tokens.saturating_add(tokens);
            let budget = session.per_error.entry(error_hash.to_string()).or_default();
            budget.attempts += 1;
            budget.fixed |= fixed;
            debug!(
                project = %project_id,
                error_hash = %error_hash,
                attempt = budget.attempts,
                session_attempts = session.attempts,
                tokens = session.tokens,
                fixed,
                "Recorded fix attempt"
            );
        })
    }

    /// Attempts made so far on one error in the current session.
    pub fn attempts_for(&self, project_id: &ProjectId, error_hash: &str) -> u32 {
        self.with_session(project_id, |session| {
            session
                .per_error
                .get(error_hash)
                .map(|b| b.attempts)
                .unwrap_or(0)
        })
    }

    pub fn remaining_tokens(&self, project_id: &ProjectId) -> u64 {
        let limit = self.config.max_tokens_per_session;
        self.with_session(project_id, |session| limit.saturating_sub(session.tokens))
    }

    pub fn usage(&self, project_id: &ProjectId) -> SessionUsage {
        self.with_session(project_id, |session| SessionUsage {
            attempts: session.attempts,
            tokens: session.tokens,
            errors_tracked: session.per_error.len(),
            errors_fixed: session.per_error.values().filter(|b| b.fixed).count(),
        })
    }

    pub fn reset_project(&self, project_id: &ProjectId) {
        self.sessions.remove(project_id);
        info!(project = %project_id, "Retry budget reset");
    }

    pub fn reset_error(&self, project_id: &ProjectId, error_hash: &str) {
        self.sessions.with_existing(project_id, |session| {
            session.per_error.remove(error_hash);
        });
        info!(project = %project_id, error_hash = %error_hash, "Per-error retry budget reset");
    }
}
