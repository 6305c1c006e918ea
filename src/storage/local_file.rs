use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{DirEntry, FileSystem, StorageError};

/// A file system rooted at a directory on the host.
///
/// `/a/b` maps to `<base_dir>/a/b`.
pub struct LocalFileSystem {
    base_dir: PathBuf,
}

impl LocalFileSystem {
    /// Create a new local file system, creating the base directory if needed.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, StorageError> {
        let path = PathBuf::from(base_dir.as_ref());

        if !path.exists() {
            fs::create_dir_all(&path)
                .map_err(|e| StorageError::io(&path.display().to_string(), e))?;
        }

        Ok(Self { base_dir: path })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base_dir.join(path.trim_start_matches('/'))
    }
}

fn map_err(path: &str, e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::io(path, e)
    }
}

impl FileSystem for LocalFileSystem {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        fs::read(self.resolve(path)).map_err(|e| map_err(path, e))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut file = fs::File::create(self.resolve(path)).map_err(|e| map_err(path, e))?;
        file.write_all(data).map_err(|e| map_err(path, e))?;
        file.sync_data().map_err(|e| map_err(path, e))
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(path))
            .map_err(|e| map_err(path, e))?;
        file.write_all(data).map_err(|e| map_err(path, e))?;
        file.sync_data().map_err(|e| map_err(path, e))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        fs::rename(self.resolve(from), self.resolve(to)).map_err(|e| map_err(from, e))
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        fs::remove_file(self.resolve(path)).map_err(|e| map_err(path, e))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        fs::metadata(self.resolve(path))
            .map(|m| m.len())
            .map_err(|e| map_err(path, e))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let dir = self.resolve(path);
        if dir.exists() && !dir.is_dir() {
            return Err(StorageError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| map_err(path, e))? {
            let entry = entry.map_err(|e| map_err(path, e))?;
            let metadata = entry.metadata().map_err(|e| map_err(path, e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn create_dir_all(&self, path: &str) -> Result<(), StorageError> {
        fs::create_dir_all(self.resolve(path)).map_err(|e| map_err(path, e))
    }
}
