//! Durable upload state
//!
//! Tracks which day folders are fully uploaded, which are pending (seen but
//! empty), per-file fingerprints for change detection, the single folder
//! being retried, and the last successful upload time. State lives in memory
//! and is persisted as a snapshot plus an append-only journal of deltas.

pub mod bounded;
pub mod day;
pub mod record;
pub mod store;

pub use day::DayKey;
pub use record::{FileFingerprint, FingerprintFlags, JournalEvent, PathHash, RetryState};
pub use store::{
    LoadReport, PendingFolder, SaveReport, StateData, StoreLimits, UploadStateStore,
    PENDING_FOLDER_TIMEOUT_SECONDS,
};

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Invalid day key: {0}")]
    InvalidDay(String),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Compaction failed: {0}")]
    CompactionFailed(String),
}
