use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::TransferError;
use crate::storage::FileSystem;

/// Destination for uploaded files.
#[async_trait]
pub trait UploadBackend: Send + Sync {
    fn name(&self) -> &str;

    /// True when the backend keeps a live connection that a link cycle
    /// would break.
    fn is_stateful(&self) -> bool {
        false
    }

    /// Copy `path` from the card. Returns the number of bytes sent.
    async fn upload(&self, card: &dyn FileSystem, path: &str) -> Result<u64, TransferError>;
}

/// Mirrors files into another file system at the same relative path.
pub struct DirectoryBackend {
    dest: Arc<dyn FileSystem>,
}

impl DirectoryBackend {
    pub fn new(dest: Arc<dyn FileSystem>) -> Self {
        Self { dest }
    }
}

#[async_trait]
impl UploadBackend for DirectoryBackend {
    fn name(&self) -> &str {
        "directory"
    }

    async fn upload(&self, card: &dyn FileSystem, path: &str) -> Result<u64, TransferError> {
        let data = card.read(path)?;
        if let Some(parent) = Path::new(path).parent().and_then(|p| p.to_str()) {
            if !parent.is_empty() && parent != "/" {
                self.dest.create_dir_all(parent)?;
            }
        }
        self.dest
            .write(path, &data)
            .map_err(|e| TransferError::BackendError {
                backend: self.name().to_string(),
                reason: e.to_string(),
            })?;
        log::debug!("Uploaded {} ({} bytes)", path, data.len());
        Ok(data.len() as u64)
    }
}
