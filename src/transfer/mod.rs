//! Card-to-destination transfer
//!
//! [`UploadWorker`] is the session body run under the supervisor: it walks
//! the day folders on the card, consults and updates the state store, and
//! pushes files through an [`UploadBackend`].

pub mod backend;
pub mod budget;
pub mod worker;

pub use backend::{DirectoryBackend, UploadBackend};
pub use budget::TimeBudget;
pub use worker::{UploadWorker, WorkerConfig, DATALOG_DIR, SETTINGS_DIR};

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Upload to {backend} failed: {reason}")]
    BackendError { backend: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network link is down")]
    LinkDown,

    #[error("Transfer cancelled")]
    Cancelled,
}
