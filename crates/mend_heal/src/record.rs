//! Records produced by the fix loop.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mend_core::{ErrorReport, ErrorSource, ProjectId};
use mend_runner::RestartReport;

use crate::classifier::Classification;
use crate::plan::FixSource;

/// A reported error after normalization and classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub source: ErrorSource,
    /// Normalized error hash
    pub hash: String,
    pub classification: Classification,
    pub fixable: bool,
}

impl ErrorRecord {
    pub fn new(report: &ErrorReport, hash: String, classification: Classification) -> Self {
        Self {
            message: report.message.clone(),
            file_path: report.file_path.clone(),
            source: report.source,
            hash,
            fixable: classification.fixable,
            classification,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Success,
    Fail,
    Denied,
}

/// One entry of a project's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    pub error_hash: String,
    pub attempt: u32,
    pub tokens: u64,
    pub result: AttemptResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FixSource>,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// Final status of one fix cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    /// Applied and verified
    Fixed,
    /// Applied but verification failed
    VerificationFailed,
    /// The patch batch was rejected
    ApplyFailed,
    /// No fix could be obtained
    NoFix,
    /// Breaker or limiter said no
    Denied,
    Unfixable,
    Cancelled,
    /// Another fix is already in flight for the project
    Busy,
    /// The project is not accepting reports
    Halted,
    /// A watchdog fired
    TimedOut,
}

impl FixStatus {
    pub fn is_success(self) -> bool {
        self == Self::Fixed
    }

    /// Whether the cycle actually tried a fix.
    pub fn attempted(self) -> bool {
        matches!(
            self,
            Self::Fixed | Self::VerificationFailed | Self::ApplyFailed | Self::NoFix | Self::TimedOut
        )
    }
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fixed => "fixed",
            Self::VerificationFailed => "verification_failed",
            Self::ApplyFailed => "apply_failed",
            Self::NoFix => "no_fix",
            Self::Denied => "denied",
            Self::Unfixable => "unfixable",
            Self::Cancelled => "cancelled",
            Self::Busy => "busy",
            Self::Halted => "halted",
            Self::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Terminal record of one fix cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixOutcome {
    pub project_id: ProjectId,
    pub error_hash: String,
    pub attempt: u32,
    pub status: FixStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FixSource>,
    pub tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartReport>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FixOutcome {
    pub fn new(project_id: ProjectId, error_hash: impl Into<String>, status: FixStatus) -> Self {
        Self {
            project_id,
            error_hash: error_hash.into(),
            attempt: 0,
            status,
            source: None,
            tokens: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            restart: None,
            files_changed: Vec::new(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_fixed(&self) -> bool {
        self.status.is_success()
    }
}
