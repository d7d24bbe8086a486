//! Append-only JSONL event journal.
//!
//! ```text
//! <dir>/
//! ├── <project>.jsonl     # one serialized Event per line
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CoreResult;
use crate::events::{Event, EventSubscription};
use crate::types::ProjectId;

/// Keep file names portable regardless of what a project id contains.
fn file_stem(project_id: &ProjectId) -> String {
    project_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct EventJournal {
    dir: PathBuf,
}

impl EventJournal {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Journal under `<root>/.mend/events`.
    pub fn in_workspace(root: &Path) -> Self {
        Self::new(root.join(".mend").join("events"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, project_id: &ProjectId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", file_stem(project_id)))
    }

    pub fn append(&self, event: &Event) -> CoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&event.project_id))?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// All journaled events for a project, oldest first.
    pub fn load(&self, project_id: &ProjectId) -> CoreResult<Vec<Event>> {
        let path = self.path_for(project_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                events.push(serde_json::from_str(&line)?);
            }
        }
        Ok(events)
    }

    pub fn load_recent(&self, project_id: &ProjectId, count: usize) -> CoreResult<Vec<Event>> {
        let mut events = self.load(project_id)?;
        let start = events.len().saturating_sub(count);
        Ok(events.split_off(start))
    }

    /// Drain a subscription into the journal until the bus shuts down.
    pub fn spawn(self, mut subscription: EventSubscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(e) = self.append(&event) {
                    warn!(project = %event.project_id, "Failed to journal event: {}", e);
                }
            }
            debug!("event journal stopped ({} missed)", subscription.missed());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let journal = EventJournal::new(dir.path());

        journal.append(&Event::status("p1", "one")).unwrap();
        journal.append(&Event::error("p1", "two")).unwrap();
        journal.append(&Event::status("p2", "other")).unwrap();

        let events = journal.load(&ProjectId::from("p1")).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message, "two");

        let recent = journal.load_recent(&ProjectId::from("p1"), 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "two");
    }

    #[test]
    fn test_unsafe_project_id_is_sanitized() {
        let dir = TempDir::new().unwrap();
        let journal = EventJournal::new(dir.path());
        journal.append(&Event::status("../escape", "x")).unwrap();

        assert!(dir.path().join(".._escape.jsonl").exists());
        assert_eq!(journal.load(&ProjectId::from("../escape")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_journal_drains_bus() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::default();
        let handle = EventJournal::new(dir.path()).spawn(bus.subscribe_all());

        bus.publish(Event::status("p1", "a")).unwrap();
        bus.publish(Event::status("p1", "b")).unwrap();
        bus.shutdown();
        handle.await.unwrap();

        let events = EventJournal::new(dir.path())
            .load(&ProjectId::from("p1"))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
    }
}
