//! Shared identifiers and input records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a generated project (and of its sandbox).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Where a reported error was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Build or install step
    Build,
    /// Running application process
    Runtime,
    /// Preview/dev server
    Preview,
    /// Generic file or log watcher
    Watcher,
}

impl Default for ErrorSource {
    fn default() -> Self {
        Self::Watcher
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Build => "build",
            Self::Runtime => "runtime",
            Self::Preview => "preview",
            Self::Watcher => "watcher",
        };
        f.write_str(name)
    }
}

/// An error pushed by an external build/runtime watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub project_id: ProjectId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub source: ErrorSource,
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(project_id: impl Into<ProjectId>, message: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            message: message.into(),
            file_path: None,
            source: ErrorSource::default(),
            reported_at: Utc::now(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: ErrorSource) -> Self {
        self.source = source;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_report_deserializes_with_defaults() {
        let report: ErrorReport =
            serde_json::from_str(r#"{"project_id":"p1","message":"boom"}"#).unwrap();

        assert_eq!(report.project_id.as_str(), "p1");
        assert_eq!(report.source, ErrorSource::Watcher);
        assert!(report.file_path.is_none());
    }
}
