//! Atomic application of file edit batches.
//!
//! A batch is staged completely in memory first: every path is validated,
//! every base hash checked and every diff applied against the current (or
//! already staged) content. Only when all of that succeeds are the staged
//! versions written. A write failure midway rolls back whatever the batch
//! already wrote.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use mend_core::content_hash;

use crate::error::{HealError, HealResult};
use crate::plan::FileChangeRequest;
use crate::store::{validate_relative_path, FileStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Applied,
    /// Final content equals the original
    Unchanged,
    Rejected,
    /// Written, then restored after a later write failed
    RolledBack,
    /// Never written because the batch failed
    NotAttempted,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Rejected => "rejected",
            Self::RolledBack => "rolled_back",
            Self::NotAttempted => "not_attempted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    pub path: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FileResult {
    fn new(path: &str, status: FileStatus) -> Self {
        Self {
            path: path.to_string(),
            status,
            message: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Batch-level result with a per-file breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub applied: bool,
    pub files: Vec<FileResult>,
}

impl PatchOutcome {
    /// Paths whose content actually changed.
    pub fn changed_files(&self) -> Vec<String> {
        if !self.applied {
            return Vec::new();
        }
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Applied)
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn rejections(&self) -> Vec<&FileResult> {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Rejected)
            .collect()
    }

    /// First rejection message, for outcome reasons.
    pub fn reason(&self) -> Option<String> {
        self.rejections()
            .first()
            .map(|f| format!("{}: {}", f.path, f.message.as_deref().unwrap_or("rejected")))
    }
}

/// Staged state of one path within a batch.
struct Staged {
    path: String,
    original: Option<String>,
    content: Option<String>,
}

/// Apply a unified diff to `base`.
pub fn apply_unified_diff(base: &str, diff: &str) -> HealResult<String> {
    let patch = diffy::Patch::from_str(diff)
        .map_err(|e| HealError::Patch(format!("malformed diff: {}", e)))?;
    diffy::apply(base, &patch)
        .map_err(|e| HealError::Patch(format!("diff does not apply: {}", e)))
}

/// Unified diff turning `original` into `modified`.
pub fn make_diff(original: &str, modified: &str) -> String {
    diffy::create_patch(original, modified).to_string()
}

pub struct PatchApplier {
    store: Arc<dyn FileStore>,
}

impl PatchApplier {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Validate a batch without writing anything.
    pub fn check(&self, changes: &[FileChangeRequest]) -> PatchOutcome {
        match self.stage(changes) {
            Ok(staged) => PatchOutcome {
                applied: true,
                files: staged
                    .iter()
                    .map(|s| FileResult::new(&s.path, Self::planned_status(s)))
                    .collect(),
            },
            Err(files) => PatchOutcome {
                applied: false,
                files,
            },
        }
    }

    /// Apply a batch atomically.
    pub fn apply(&self, changes: &[FileChangeRequest]) -> PatchOutcome {
        let staged = match self.stage(changes) {
            Ok(staged) => staged,
            Err(files) => {
                warn!(files = changes.len(), "Patch batch rejected during staging");
                return PatchOutcome {
                    applied: false,
                    files,
                };
            }
        };

        let mut files: Vec<FileResult> = Vec::with_capacity(staged.len());
        let mut written: Vec<usize> = Vec::new();

        for (index, item) in staged.iter().enumerate() {
            if item.original == item.content {
                files.push(FileResult::new(&item.path, FileStatus::Unchanged));
                continue;
            }

            let result = match &item.content {
                Some(content) => self.store.write(&item.path, content),
                None => self.store.remove(&item.path),
            };

            if let Err(e) = result {
                error!(path = %item.path, error = %e, "Write failed, rolling back batch");
                self.rollback(&staged, &written, &mut files);
                files.push(
                    FileResult::new(&item.path, FileStatus::Rejected).with_message(e.to_string()),
                );
                files.extend(
                    staged[index + 1..]
                        .iter()
                        .map(|s| FileResult::new(&s.path, FileStatus::NotAttempted)),
                );
                return PatchOutcome {
                    applied: false,
                    files,
                };
            }

            debug!(path = %item.path, "File written");
            written.push(index);
            files.push(FileResult::new(&item.path, FileStatus::Applied));
        }

        info!(
            files = files.len(),
            changed = written.len(),
            "Patch batch applied"
        );
        PatchOutcome {
            applied: true,
            files,
        }
    }

    fn planned_status(item: &Staged) -> FileStatus {
        if item.original == item.content {
            FileStatus::Unchanged
        } else {
            FileStatus::Applied
        }
    }

    fn rollback(&self, staged: &[Staged], written: &[usize], files: &mut [FileResult]) {
        for &index in written.iter().rev() {
            let item = &staged[index];
            let restored = match &item.original {
                Some(original) => self.store.write(&item.path, original),
                None => self.store.remove(&item.path),
            };
            let result = &mut files[index];
            match restored {
                Ok(()) => result.status = FileStatus::RolledBack,
                Err(e) => {
                    error!(path = %item.path, error = %e, "Rollback failed");
                    result.status = FileStatus::Rejected;
                    result.message = Some(format!("rollback failed: {}", e));
                }
            }
        }
    }

    /// Stage every change in memory. On failure returns per-file results
    /// with the offending files rejected and all others not attempted.
    fn stage(&self, changes: &[FileChangeRequest]) -> Result<Vec<Staged>, Vec<FileResult>> {
        let mut staged: Vec<Staged> = Vec::new();
        let mut index_of: HashMap<String, usize> = HashMap::new();
        let mut rejected: Vec<FileResult> = Vec::new();

        for change in changes {
            let path = change.path().trim_start_matches("./").to_string();

            if let Err(e) = validate_relative_path(&path) {
                rejected.push(FileResult::new(&path, FileStatus::Rejected).with_message(e.to_string()));
                continue;
            }

            let current = match index_of.get(&path) {
                Some(&i) => staged[i].content.clone(),
                None => match self.store.read(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        rejected.push(
                            FileResult::new(&path, FileStatus::Rejected).with_message(e.to_string()),
                        );
                        continue;
                    }
                },
            };

            match Self::stage_one(change, current.as_deref()) {
                Ok(content) => match index_of.get(&path) {
                    Some(&i) => staged[i].content = content,
                    None => {
                        index_of.insert(path.clone(), staged.len());
                        staged.push(Staged {
                            path,
                            original: current,
                            content,
                        });
                    }
                },
                Err(message) => {
                    rejected.push(FileResult::new(&path, FileStatus::Rejected).with_message(message))
                }
            }
        }

        if rejected.is_empty() {
            return Ok(staged);
        }

        let mut files = rejected;
        for item in &staged {
            if !files.iter().any(|f| f.path == item.path) {
                files.push(
                    FileResult::new(&item.path, FileStatus::NotAttempted)
                        .with_message("batch rejected"),
                );
            }
        }
        Err(files)
    }

    /// New content for one change, `None` meaning the file is removed.
    fn stage_one(change: &FileChangeRequest, current: Option<&str>) -> Result<Option<String>, String> {
        if let Some(expected) = change.base_hash() {
            match current {
                Some(content) if content_hash(content) == expected => {}
                Some(_) => return Err("stale base hash".to_string()),
                None => return Err("file does not exist".to_string()),
            }
        }

        match change {
            FileChangeRequest::Diff { diff, .. } => {
                let base = current.unwrap_or_default();
                apply_unified_diff(base, diff)
                    .map(Some)
                    .map_err(|e| e.to_string())
            }
            FileChangeRequest::Replace { content, .. } => Ok(Some(content.clone())),
            FileChangeRequest::Create { content, .. } => match current {
                None => Ok(Some(content.clone())),
                Some(existing) if existing == content => Ok(Some(content.clone())),
                Some(_) => Err("file already exists with different content".to_string()),
            },
            FileChangeRequest::Delete { .. } => Ok(None),
        }
    }
}
