//! Error types for the runner module.

use thiserror::Error;

use mend_core::CoreError;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur during sandbox operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Sandbox runtime not available: {0}")]
    RuntimeUnavailable(String),

    #[error("No sandbox for project {0}")]
    SandboxNotFound(String),

    #[error("{step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RunnerError {
    pub fn step_failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
