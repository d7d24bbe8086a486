//! File access capability used by the patch applier.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;

use crate::error::{HealError, HealResult};

/// Read/write access to a project's source tree.
///
/// Paths are always relative to the project root.
pub trait FileStore: Send + Sync {
    /// Current content, `None` if the file does not exist.
    fn read(&self, path: &str) -> HealResult<Option<String>>;

    fn write(&self, path: &str, content: &str) -> HealResult<()>;

    fn remove(&self, path: &str) -> HealResult<()>;

    fn exists(&self, path: &str) -> HealResult<bool> {
        Ok(self.read(path)?.is_some())
    }
}

/// Reject absolute paths and anything that climbs out of the project root.
pub fn validate_relative_path(path: &str) -> HealResult<()> {
    if path.trim().is_empty() {
        return Err(HealError::store(path, "empty path"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(HealError::store(path, "absolute paths are not allowed"));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(HealError::store(path, "path escapes the project root"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(HealError::store(path, "absolute paths are not allowed"))
            }
        }
    }
    Ok(())
}

/// File store over a directory on disk.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> HealResult<PathBuf> {
        validate_relative_path(path)?;
        Ok(self.root.join(path))
    }
}

impl FileStore for LocalFileStore {
    fn read(&self, path: &str) -> HealResult<Option<String>> {
        let full = self.resolve(path)?;
        match fs::read_to_string(&full) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HealError::store(path, e.to_string())),
        }
    }

    /// Writes through a temp file in the target directory, then renames it
    /// into place.
    fn write(&self, path: &str, content: &str) -> HealResult<()> {
        let full = self.resolve(path)?;
        let parent = full
            .parent()
            .ok_or_else(|| HealError::store(path, "no parent directory"))?;
        fs::create_dir_all(parent).map_err(|e| HealError::store(path, e.to_string()))?;

        let mut tmp =
            NamedTempFile::new_in(parent).map_err(|e| HealError::store(path, e.to_string()))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| HealError::store(path, e.to_string()))?;
        tmp.persist(&full)
            .map_err(|e| HealError::store(path, e.error.to_string()))?;
        Ok(())
    }

    fn remove(&self, path: &str) -> HealResult<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HealError::store(path, e.to_string())),
        }
    }

    fn exists(&self, path: &str) -> HealResult<bool> {
        Ok(self.resolve(path)?.is_file())
    }
}

/// In-memory file store for tests, with write failure injection.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<BTreeMap<String, String>>,
    failing: RwLock<BTreeSet<String>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.write().insert(path.into(), content.into());
        self
    }

    /// Make every write or removal of `path` fail.
    pub fn fail_writes_to(&self, path: impl Into<String>) {
        self.failing.write().insert(path.into());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files.read().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    fn check_failure(&self, path: &str) -> HealResult<()> {
        if self.failing.read().contains(path) {
            return Err(HealError::store(path, "injected write failure"));
        }
        Ok(())
    }
}

impl FileStore for MemoryFileStore {
    fn read(&self, path: &str) -> HealResult<Option<String>> {
        validate_relative_path(path)?;
        Ok(self.get(path))
    }

    fn write(&self, path: &str, content: &str) -> HealResult<()> {
        validate_relative_path(path)?;
        self.check_failure(path)?;
        self.files
            .write()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn remove(&self, path: &str) -> HealResult<()> {
        validate_relative_path(path)?;
        self.check_failure(path)?;
        self.files.write().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_validation() {
        assert!(validate_relative_path("src/app/page.tsx").is_ok());
        assert!(validate_relative_path("./package.json").is_ok());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("../outside.txt").is_err());
        assert!(validate_relative_path("src/../../x").is_err());
        assert!(validate_relative_path("").is_err());
    }

    #[test]
    fn test_local_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(dir.path());

        assert_eq!(store.read("src/index.ts").unwrap(), None);
        store.write("src/index.ts", "export {};\n").unwrap();
        assert!(store.exists("src/index.ts").unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join("src/index.ts")).unwrap(),
            "export {};\n"
        );

        store.remove("src/index.ts").unwrap();
        assert!(!store.exists("src/index.ts").unwrap());
        // removing twice is fine
        store.remove("src/index.ts").unwrap();
    }

    #[test]
    fn test_local_store_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(store.write("../evil.txt", "x").is_err());
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryFileStore::new().with_file("a.txt", "a");
        store.fail_writes_to("a.txt");
        assert!(store.write("a.txt", "b").is_err());
        assert_eq!(store.get("a.txt").as_deref(), Some("a"));
        store.write("b.txt", "b").unwrap();
        assert_eq!(store.paths(), vec!["a.txt", "b.txt"]);
    }
}
