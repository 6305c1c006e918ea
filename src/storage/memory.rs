//! In-memory file system with fault injection
//!
//! Used by tests and the host simulator in place of the internal flash and
//! the card. Faults are armed per operation and path fragment so a test can
//! fail exactly one step of a multi-step write sequence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::{DirEntry, FileSystem, StorageError};

/// File-system operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Read,
    Write,
    Append,
    Rename,
    Remove,
}

#[derive(Debug, Clone)]
struct Fault {
    op: FaultOp,
    path_fragment: String,
}

#[derive(Default)]
struct Inner {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    faults: Vec<Fault>,
}

impl Inner {
    fn check(&self, op: FaultOp, path: &str) -> Result<(), StorageError> {
        let hit = self
            .faults
            .iter()
            .any(|f| f.op == op && path.contains(&f.path_fragment));
        if hit {
            Err(StorageError::io(path, format!("injected {:?} fault", op)))
        } else {
            Ok(())
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        if path == "/" || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// In-memory [`FileSystem`].
#[derive(Default)]
pub struct MemoryFileSystem {
    inner: Mutex<Inner>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every `op` on paths containing `path_fragment` until cleared.
    pub fn inject_fault(&self, op: FaultOp, path_fragment: &str) {
        self.lock().faults.push(Fault {
            op,
            path_fragment: path_fragment.to_string(),
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// All file paths currently stored, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Read a file as UTF-8 text, for assertions.
    pub fn read_to_string(&self, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&normalize(path))
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let path = normalize(path);
        let inner = self.lock();
        inner.check(FaultOp::Read, &path)?;
        inner
            .files
            .get(&path)
            .cloned()
            .ok_or(StorageError::NotFound(path))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = normalize(path);
        let mut inner = self.lock();
        inner.check(FaultOp::Write, &path)?;
        inner.files.insert(path, data.to_vec());
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = normalize(path);
        let mut inner = self.lock();
        inner.check(FaultOp::Append, &path)?;
        inner.files.entry(path).or_default().extend_from_slice(data);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from = normalize(from);
        let to = normalize(to);
        let mut inner = self.lock();
        inner.check(FaultOp::Rename, &from)?;
        let data = inner
            .files
            .remove(&from)
            .ok_or_else(|| StorageError::NotFound(from.clone()))?;
        inner.files.insert(to, data);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize(path);
        let mut inner = self.lock();
        inner.check(FaultOp::Remove, &path)?;
        inner
            .files
            .remove(&path)
            .map(|_| ())
            .ok_or(StorageError::NotFound(path))
    }

    fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        let inner = self.lock();
        inner.files.contains_key(&path) || inner.is_dir(&path)
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        let path = normalize(path);
        let inner = self.lock();
        inner
            .files
            .get(&path)
            .map(|d| d.len() as u64)
            .ok_or(StorageError::NotFound(path))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let path = normalize(path);
        let inner = self.lock();
        inner.check(FaultOp::Read, &path)?;
        if inner.files.contains_key(&path) {
            return Err(StorageError::NotADirectory(path));
        }
        if !inner.is_dir(&path) {
            return Err(StorageError::NotFound(path));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut children: BTreeMap<String, DirEntry> = BTreeMap::new();

        for (file, data) in inner.files.iter() {
            if let Some(rest) = file.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        children.entry(dir.to_string()).or_insert(DirEntry {
                            name: dir.to_string(),
                            is_dir: true,
                            size: 0,
                        });
                    }
                    None => {
                        children.insert(
                            rest.to_string(),
                            DirEntry {
                                name: rest.to_string(),
                                is_dir: false,
                                size: data.len() as u64,
                            },
                        );
                    }
                }
            }
        }
        for dir in inner.dirs.iter() {
            if let Some(rest) = dir.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                if !name.is_empty() {
                    children.entry(name.to_string()).or_insert(DirEntry {
                        name: name.to_string(),
                        is_dir: true,
                        size: 0,
                    });
                }
            }
        }

        Ok(children.into_values().collect())
    }

    fn create_dir_all(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize(path);
        self.lock().dirs.insert(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_dir_reports_files_and_subdirs() {
        let fs = MemoryFileSystem::new();
        fs.write("/DATALOG/20250101/a.edf", b"1234").unwrap();
        fs.write("/DATALOG/20250102/b.edf", b"1").unwrap();
        fs.create_dir_all("/DATALOG/20250103").unwrap();
        fs.write("/Identification.tgt", b"id").unwrap();

        let days = fs.list_dir("/DATALOG").unwrap();
        let names: Vec<&str> = days.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["20250101", "20250102", "20250103"]);
        assert!(days.iter().all(|e| e.is_dir));

        let root = fs.list_dir("/").unwrap();
        assert!(root
            .iter()
            .any(|e| e.name == "Identification.tgt" && !e.is_dir && e.size == 2));
        assert!(fs.list_dir("/DATALOG/20250103").unwrap().is_empty());
    }

    #[test]
    fn test_injected_fault_only_hits_matching_path() {
        let fs = MemoryFileSystem::new();
        fs.inject_fault(FaultOp::Write, ".tmp");

        assert!(fs.write("/state.tmp", b"x").is_err());
        assert!(fs.write("/state.snap", b"x").is_ok());

        fs.clear_faults();
        assert!(fs.write("/state.tmp", b"x").is_ok());
    }

    #[test]
    fn test_rename_moves_contents() {
        let fs = MemoryFileSystem::new();
        fs.write("/a", b"data").unwrap();
        fs.rename("/a", "/b").unwrap();
        assert!(!fs.exists("/a"));
        assert_eq!(fs.read_to_string("/b").unwrap(), "data");
        assert!(fs.rename("/a", "/c").unwrap_err().is_not_found());
    }
}
