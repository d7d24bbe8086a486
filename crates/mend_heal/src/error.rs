//! Error types for the heal module.

use thiserror::Error;

use mend_core::CoreError;
use mend_runner::RunnerError;

/// Result type alias for heal operations.
pub type HealResult<T> = Result<T, HealError>;

/// Errors that can occur while classifying, patching or proposing fixes.
#[derive(Error, Debug)]
pub enum HealError {
    #[error("Patch rejected: {0}")]
    Patch(String),

    #[error("File store error at {path}: {message}")]
    Store { path: String, message: String },

    #[error("Fix proposal failed: {0}")]
    Proposal(String),

    #[error("Project not registered: {0}")]
    UnknownProject(String),

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Invalid rule: {0}")]
    Rule(#[from] regex::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HealError {
    pub fn store(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            path: path.into(),
            message: message.into(),
        }
    }
}
