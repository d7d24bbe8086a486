//! Fix payloads: file edits plus infrastructure actions.

use std::fmt;

use serde::{Deserialize, Serialize};

use mend_runner::RemediationAction;

/// One edit to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileChangeRequest {
    /// Unified diff against the current content
    Diff {
        path: String,
        diff: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_hash: Option<String>,
    },
    /// Whole-file replacement
    Replace {
        path: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_hash: Option<String>,
    },
    /// New file; fails if a different file already exists
    Create { path: String, content: String },
    Delete {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_hash: Option<String>,
    },
}

impl FileChangeRequest {
    pub fn diff(path: impl Into<String>, diff: impl Into<String>) -> Self {
        Self::Diff {
            path: path.into(),
            diff: diff.into(),
            base_hash: None,
        }
    }

    pub fn replace(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Replace {
            path: path.into(),
            content: content.into(),
            base_hash: None,
        }
    }

    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Create {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::Delete {
            path: path.into(),
            base_hash: None,
        }
    }

    /// Require the file to currently hash to `hash`.
    pub fn with_base_hash(mut self, hash: impl Into<String>) -> Self {
        match &mut self {
            Self::Diff { base_hash, .. }
            | Self::Replace { base_hash, .. }
            | Self::Delete { base_hash, .. } => *base_hash = Some(hash.into()),
            Self::Create { .. } => {}
        }
        self
    }

    pub fn without_base_hash(mut self) -> Self {
        match &mut self {
            Self::Diff { base_hash, .. }
            | Self::Replace { base_hash, .. }
            | Self::Delete { base_hash, .. } => *base_hash = None,
            Self::Create { .. } => {}
        }
        self
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Diff { path, .. }
            | Self::Replace { path, .. }
            | Self::Create { path, .. }
            | Self::Delete { path, .. } => path,
        }
    }

    pub fn base_hash(&self) -> Option<&str> {
        match self {
            Self::Diff { base_hash, .. }
            | Self::Replace { base_hash, .. }
            | Self::Delete { base_hash, .. } => base_hash.as_deref(),
            Self::Create { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Diff { .. } => "diff",
            Self::Replace { .. } => "replace",
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Where a fix came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixSource {
    Rule,
    Cache,
    Proposer,
    Remediation,
}

impl fmt::Display for FixSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rule => "rule",
            Self::Cache => "cache",
            Self::Proposer => "proposer",
            Self::Remediation => "remediation",
        };
        f.write_str(name)
    }
}

/// A complete fix: file edits applied as one batch, then runtime actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixPlan {
    pub description: String,
    #[serde(default)]
    pub changes: Vec<FileChangeRequest>,
    #[serde(default)]
    pub actions: Vec<RemediationAction>,
    pub source: FixSource,
}

impl FixPlan {
    pub fn new(description: impl Into<String>, source: FixSource) -> Self {
        Self {
            description: description.into(),
            changes: Vec::new(),
            actions: Vec::new(),
            source,
        }
    }

    pub fn with_change(mut self, change: FileChangeRequest) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_changes(mut self, changes: impl IntoIterator<Item = FileChangeRequest>) -> Self {
        self.changes.extend(changes);
        self
    }

    pub fn with_action(mut self, action: RemediationAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.actions.is_empty()
    }

    /// Copy suitable for caching: replays are validated by diff context,
    /// not by a hash of the file as it was at the time.
    pub fn without_base_hashes(&self) -> Self {
        Self {
            changes: self
                .changes
                .iter()
                .cloned()
                .map(FileChangeRequest::without_base_hash)
                .collect(),
            ..self.clone()
        }
    }

    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.changes.iter().map(|c| c.path().to_string()).collect();
        paths.dedup();
        paths
    }
}
