//! Blocking file-system abstraction
//!
//! The state store and the transfer worker never touch `std::fs` directly.
//! They go through [`FileSystem`], which has a directory-backed
//! implementation for real use and an in-memory one with fault injection
//! for tests and the host simulator.

pub mod local_file;
pub mod memory;

pub use local_file::LocalFileSystem;
pub use memory::MemoryFileSystem;

use thiserror::Error;

/// Error types for file-system operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {reason}")]
    IoError { path: String, reason: String },

    #[error("Not a directory: {0}")]
    NotADirectory(String),
}

impl StorageError {
    pub fn io(path: &str, reason: impl ToString) -> Self {
        StorageError::IoError {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A single directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Blocking file-system operations used by the engine.
///
/// Paths are absolute within the file system (`/DATALOG/20250101/a.edf`).
pub trait FileSystem: Send + Sync {
    /// Read the whole file.
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Create or truncate the file and write `data`.
    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Append `data`, creating the file if needed.
    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    fn remove(&self, path: &str) -> Result<(), StorageError>;

    fn exists(&self, path: &str) -> bool;

    fn size(&self, path: &str) -> Result<u64, StorageError>;

    /// List the direct children of a directory.
    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError>;

    fn create_dir_all(&self, path: &str) -> Result<(), StorageError>;
}

/// Join a directory path and a child name with exactly one separator.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    format!("{}/{}", dir, name)
}

/// Remove a file if it exists. Absence is not an error.
pub fn remove_if_exists(fs: &dyn FileSystem, path: &str) -> Result<(), StorageError> {
    match fs.remove(path) {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/DATALOG", "20250101"), "/DATALOG/20250101");
        assert_eq!(join_path("/DATALOG/", "/a.edf"), "/DATALOG/a.edf");
        assert_eq!(join_path("", "a"), "/a");
    }

    #[test]
    fn test_remove_if_exists_tolerates_missing() {
        let fs = MemoryFileSystem::new();
        assert!(remove_if_exists(&fs, "/missing").is_ok());
        fs.write("/present", b"x").unwrap();
        remove_if_exists(&fs, "/present").unwrap();
        assert!(!fs.exists("/present"));
    }
}
