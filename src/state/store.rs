//! Snapshot + journal persistence for upload progress
//!
//! Every mutation is applied to memory at once and queued as a
//! [`JournalEvent`]. `save()` appends the queue to the journal in one write
//! and then compacts when the journal has grown too large, a capacity
//! eviction forced it, or no snapshot exists yet. Loading replays the
//! journal over the snapshot through the same `apply` used by the mutators,
//! so a reload always reproduces the state the mutators built.

use std::sync::Arc;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use super::bounded::{BoundedList, Evictable, FileTable};
use super::day::DayKey;
use super::record::{
    FileFingerprint, JournalEvent, PathHash, RetryState, SnapshotHeader, SnapshotRecord,
    SNAPSHOT_VERSION,
};
use super::StateError;
use crate::storage::{remove_if_exists, FileSystem, StorageError};

pub const SNAPSHOT_PATH: &str = "/upload_state.snap";
pub const JOURNAL_PATH: &str = "/upload_state.jnl";
pub const TEMP_PATH: &str = "/upload_state.tmp";
pub const RESET_MARKER_PATH: &str = "/upload_state.reset";

/// Empty folders are promoted to completed after 7 days.
pub const PENDING_FOLDER_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Table capacities and compaction thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLimits {
    pub max_completed: usize,
    pub max_pending: usize,
    pub max_files: usize,
    pub journal_max_lines: usize,
    pub journal_max_bytes: u64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_completed: 400,
            max_pending: 32,
            max_files: 256,
            journal_max_lines: 64,
            journal_max_bytes: 8 * 1024,
        }
    }
}

/// A day folder seen with no data yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFolder {
    pub day: DayKey,
    pub first_seen: u64,
}

impl Evictable for DayKey {}
impl Evictable for PendingFolder {}

/// The in-memory records, independent of how they are persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StateData {
    pub last_upload_timestamp: u64,
    pub retry: RetryState,
    pub completed: BoundedList<DayKey>,
    pub pending: BoundedList<PendingFolder>,
    pub files: FileTable,
}

#[derive(Debug, Default, Clone, Copy)]
struct Applied {
    changed: bool,
    evicted: bool,
}

impl StateData {
    pub fn new(limits: &StoreLimits) -> Self {
        Self {
            last_upload_timestamp: 0,
            retry: RetryState::default(),
            completed: BoundedList::with_capacity(limits.max_completed),
            pending: BoundedList::with_capacity(limits.max_pending),
            files: FileTable::with_capacity(limits.max_files),
        }
    }

    fn is_completed(&self, day: DayKey) -> bool {
        self.completed.contains(|d| *d == day)
    }

    fn pending_entry(&self, day: DayKey) -> Option<&PendingFolder> {
        self.pending.iter().find(|p| p.day == day)
    }

    fn apply(&mut self, event: &JournalEvent) -> Applied {
        let mut out = Applied::default();
        match *event {
            JournalEvent::AddCompleted(day) => {
                if self.pending.remove_where(|p| p.day == day).is_some() {
                    out.changed = true;
                }
                if self.retry.day == day {
                    self.retry = RetryState::default();
                    out.changed = true;
                }
                if !self.is_completed(day) {
                    if let Some(evicted) = self.completed.push(day) {
                        log::warn!("Completed folder table full, evicted {}", evicted);
                        out.evicted = true;
                    }
                    out.changed = true;
                }
            }
            JournalEvent::RemoveCompleted(day) => {
                out.changed = self.completed.remove_where(|d| *d == day).is_some();
            }
            JournalEvent::AddPending { day, first_seen } => {
                if !self.is_completed(day) && self.pending_entry(day).is_none() {
                    if let Some(evicted) = self.pending.push(PendingFolder { day, first_seen }) {
                        log::warn!("Pending folder table full, evicted {}", evicted.day);
                        out.evicted = true;
                    }
                    out.changed = true;
                }
            }
            JournalEvent::RemovePending(day) => {
                out.changed = self.pending.remove_where(|p| p.day == day).is_some();
            }
            JournalEvent::SetFile(entry) => {
                if self.files.get(entry.path_hash) != Some(&entry) {
                    if let Some(evicted) = self.files.upsert(entry) {
                        log::warn!("File table full, evicted {}", evicted.path_hash);
                        out.evicted = true;
                    }
                    out.changed = true;
                }
            }
            JournalEvent::RemoveFile(hash) => {
                out.changed = self.files.remove(hash);
            }
            JournalEvent::SetRetry(retry) => {
                if self.retry != retry {
                    self.retry = retry;
                    out.changed = true;
                }
            }
            JournalEvent::SetTimestamp(ts) => {
                if self.last_upload_timestamp != ts {
                    self.last_upload_timestamp = ts;
                    out.changed = true;
                }
            }
        }
        out
    }

    /// Full snapshot file contents.
    fn snapshot_text(&self) -> String {
        let header = SnapshotHeader {
            version: SNAPSHOT_VERSION,
            last_upload_timestamp: self.last_upload_timestamp,
        };
        let mut lines = vec![header.to_line()];
        lines.extend(self.completed.iter().map(|d| SnapshotRecord::Completed(*d).to_line()));
        lines.extend(self.pending.iter().map(|p| {
            SnapshotRecord::Pending {
                day: p.day,
                first_seen: p.first_seen,
            }
            .to_line()
        }));
        lines.extend(
            self.files
                .ordered()
                .into_iter()
                .map(|f| SnapshotRecord::File(f).to_line()),
        );
        // last, so replaying the completed days cannot clear it
        lines.push(SnapshotRecord::Retry(self.retry).to_line());

        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

/// What `load()` found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub first_boot: bool,
    pub snapshot_records: usize,
    pub journal_events: usize,
    pub skipped_lines: usize,
}

/// What `save()` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub appended: usize,
    pub compacted: bool,
}

/// Upload progress with snapshot + journal persistence.
pub struct UploadStateStore {
    fs: Arc<dyn FileSystem>,
    limits: StoreLimits,
    data: StateData,
    queued: Vec<JournalEvent>,
    journal_lines: usize,
    journal_bytes: u64,
    force_compaction: bool,
    total_folders: usize,
}

impl UploadStateStore {
    /// Create an empty store (does not touch the file system).
    pub fn new(fs: Arc<dyn FileSystem>, limits: StoreLimits) -> Self {
        Self {
            fs,
            data: StateData::new(&limits),
            limits,
            queued: Vec::new(),
            journal_lines: 0,
            journal_bytes: 0,
            force_compaction: false,
            total_folders: 0,
        }
    }

    /// Create a store and load it from disk.
    pub fn open(fs: Arc<dyn FileSystem>, limits: StoreLimits) -> Result<Self, StateError> {
        let mut store = Self::new(fs, limits);
        store.load()?;
        Ok(store)
    }

    pub fn data(&self) -> &StateData {
        &self.data
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Replace the in-memory state with snapshot + journal from disk.
    ///
    /// Malformed lines are skipped. On an I/O error the previous in-memory
    /// state is kept.
    pub fn load(&mut self) -> Result<LoadReport, StateError> {
        self.recover_orphaned_temp();

        let snapshot = read_optional(self.fs.as_ref(), SNAPSHOT_PATH)?;
        let journal = read_optional(self.fs.as_ref(), JOURNAL_PATH)?;

        let mut report = LoadReport::default();
        let mut data = StateData::new(&self.limits);
        let mut evicted = false;

        if snapshot.is_none() && journal.is_none() {
            log::info!("No upload state on disk, starting empty");
            report.first_boot = true;
            self.data = data;
            self.queued.clear();
            self.journal_lines = 0;
            self.journal_bytes = 0;
            self.force_compaction = false;
            return Ok(report);
        }

        if let Some(bytes) = snapshot {
            let text = String::from_utf8_lossy(&bytes);
            let mut lines = text.lines().filter(|l| !l.trim().is_empty());

            match lines.next().map(SnapshotHeader::parse_line) {
                Some(Ok(header)) => {
                    if header.version != SNAPSHOT_VERSION {
                        log::warn!(
                            "Snapshot version {} (expected {}), loading anyway",
                            header.version,
                            SNAPSHOT_VERSION
                        );
                    }
                    data.last_upload_timestamp = header.last_upload_timestamp;
                }
                Some(Err(e)) => {
                    log::warn!("Skipping snapshot header: {}", e);
                    report.skipped_lines += 1;
                }
                None => log::warn!("Snapshot file is empty"),
            }

            let mut retry = None;
            for line in lines {
                match SnapshotRecord::parse_line(line.trim()) {
                    Ok(SnapshotRecord::Retry(r)) => {
                        retry = Some(r);
                        report.snapshot_records += 1;
                    }
                    Ok(record) => {
                        evicted |= data.apply(&record.into_event()).evicted;
                        report.snapshot_records += 1;
                    }
                    Err(e) => {
                        log::warn!("Skipping snapshot line: {}", e);
                        report.skipped_lines += 1;
                    }
                }
            }
            // the snapshot is a state, not a history: retry is restored as written
            if let Some(r) = retry {
                data.retry = r;
            }
        }

        let mut journal_lines = 0;
        let mut journal_bytes = 0;
        if let Some(bytes) = journal {
            journal_bytes = bytes.len() as u64;
            let text = String::from_utf8_lossy(&bytes);
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                journal_lines += 1;
                match JournalEvent::parse_line(line.trim()) {
                    Ok(event) => {
                        evicted |= data.apply(&event).evicted;
                        report.journal_events += 1;
                    }
                    Err(e) => {
                        log::warn!("Skipping journal line: {}", e);
                        report.skipped_lines += 1;
                    }
                }
            }
        }

        log::info!(
            "Upload state loaded: {} completed, {} pending, {} files, {} journal events",
            data.completed.len(),
            data.pending.len(),
            data.files.len(),
            report.journal_events
        );
        if data.retry.is_active() {
            log::debug!(
                "Current retry folder: {} (attempt {})",
                data.retry.day,
                data.retry.count
            );
        }

        self.data = data;
        self.queued.clear();
        self.journal_lines = journal_lines;
        self.journal_bytes = journal_bytes;
        self.force_compaction = evicted;
        Ok(report)
    }

    /// Append queued deltas to the journal, then compact if needed.
    ///
    /// A failed append leaves both files untouched and keeps the queue for
    /// the next attempt. A failed compaction is logged and retried on a
    /// later save; the journal already holds the data.
    pub fn save(&mut self) -> Result<SaveReport, StateError> {
        let mut report = SaveReport::default();

        if !self.queued.is_empty() {
            let mut buf = String::new();
            for event in &self.queued {
                buf.push_str(&event.to_line());
                buf.push('\n');
            }
            if let Err(e) = self.fs.append(JOURNAL_PATH, buf.as_bytes()) {
                log::error!("Failed to append upload journal: {}", e);
                return Err(e.into());
            }
            report.appended = self.queued.len();
            self.journal_lines += self.queued.len();
            self.journal_bytes += buf.len() as u64;
            self.queued.clear();
        }

        if self.needs_compaction() {
            match self.compact() {
                Ok(()) => report.compacted = true,
                Err(e) => log::warn!("Upload state compaction failed: {}", e),
            }
        }

        Ok(report)
    }

    pub fn needs_compaction(&self) -> bool {
        self.force_compaction
            || self.journal_lines > self.limits.journal_max_lines
            || self.journal_bytes > self.limits.journal_max_bytes
            || !self.fs.exists(SNAPSHOT_PATH)
    }

    /// Rewrite the snapshot from memory and drop the journal.
    ///
    /// The temp file is discarded on any failure before the rename, leaving
    /// the previous snapshot and journal authoritative.
    pub fn compact(&mut self) -> Result<(), StateError> {
        let text = self.data.snapshot_text();
        let fs = self.fs.as_ref();

        let _ = remove_if_exists(fs, TEMP_PATH);

        if let Err(e) = fs.write(TEMP_PATH, text.as_bytes()) {
            discard_temp(fs);
            return Err(e.into());
        }

        match fs.read(TEMP_PATH) {
            Ok(written) if !written.is_empty() && written.len() == text.len() => {}
            Ok(written) => {
                discard_temp(fs);
                return Err(StateError::CompactionFailed(format!(
                    "temp snapshot has {} bytes, expected {}",
                    written.len(),
                    text.len()
                )));
            }
            Err(e) => {
                discard_temp(fs);
                return Err(e.into());
            }
        }

        if let Err(e) = remove_if_exists(fs, SNAPSHOT_PATH) {
            discard_temp(fs);
            return Err(e.into());
        }

        // A failed rename keeps the temp file; load() promotes it.
        fs.rename(TEMP_PATH, SNAPSHOT_PATH)?;

        remove_if_exists(fs, JOURNAL_PATH).map_err(|e| {
            StateError::CompactionFailed(format!("snapshot written but journal kept: {}", e))
        })?;

        log::debug!(
            "Upload state compacted ({} bytes, {} journal lines dropped)",
            text.len(),
            self.journal_lines
        );
        self.journal_lines = 0;
        self.journal_bytes = 0;
        self.force_compaction = false;
        Ok(())
    }

    fn recover_orphaned_temp(&self) {
        let fs = self.fs.as_ref();
        if !fs.exists(TEMP_PATH) {
            return;
        }
        if fs.exists(SNAPSHOT_PATH) {
            let _ = remove_if_exists(fs, TEMP_PATH);
            return;
        }

        let valid = fs
            .read(TEMP_PATH)
            .map(|bytes| {
                let text = String::from_utf8_lossy(&bytes);
                text.lines()
                    .next()
                    .map(|l| SnapshotHeader::parse_line(l).is_ok())
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        if valid && fs.rename(TEMP_PATH, SNAPSHOT_PATH).is_ok() {
            log::warn!("Recovered snapshot from interrupted compaction");
        } else {
            let _ = remove_if_exists(fs, TEMP_PATH);
        }
    }

    fn record(&mut self, event: JournalEvent) -> bool {
        let applied = self.data.apply(&event);
        if applied.evicted {
            self.force_compaction = true;
        }
        if applied.changed {
            self.queued.push(event);
        }
        applied.changed
    }

    pub fn queued_events(&self) -> usize {
        self.queued.len()
    }

    pub fn journal_line_count(&self) -> usize {
        self.journal_lines
    }

    pub fn is_compaction_forced(&self) -> bool {
        self.force_compaction
    }

    // ------------------------------------------------------------------
    // Deferred reset
    // ------------------------------------------------------------------

    /// Ask for the persisted state to be wiped on the next boot.
    pub fn request_reset(fs: &dyn FileSystem) -> Result<(), StateError> {
        fs.write(RESET_MARKER_PATH, b"reset\n")?;
        log::warn!("Upload state reset scheduled for next boot");
        Ok(())
    }

    /// Wipe persisted state if a reset was requested. Returns whether it did.
    pub fn process_pending_reset(fs: &dyn FileSystem) -> Result<bool, StateError> {
        if !fs.exists(RESET_MARKER_PATH) {
            return Ok(false);
        }
        remove_if_exists(fs, SNAPSHOT_PATH)?;
        remove_if_exists(fs, JOURNAL_PATH)?;
        remove_if_exists(fs, TEMP_PATH)?;
        remove_if_exists(fs, RESET_MARKER_PATH)?;
        log::warn!("Upload state wiped by user reset");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Day folders
    // ------------------------------------------------------------------

    pub fn is_folder_completed(&self, folder: &str) -> bool {
        folder_key(folder).map_or(false, |day| self.data.is_completed(day))
    }

    pub fn mark_folder_completed(&mut self, folder: &str) -> bool {
        match folder_key(folder) {
            Some(day) => self.record(JournalEvent::AddCompleted(day)),
            None => false,
        }
    }

    pub fn remove_folder_from_completed(&mut self, folder: &str) -> bool {
        match folder_key(folder) {
            Some(day) => self.record(JournalEvent::RemoveCompleted(day)),
            None => false,
        }
    }

    pub fn is_pending_folder(&self, folder: &str) -> bool {
        folder_key(folder).map_or(false, |day| self.data.pending_entry(day).is_some())
    }

    /// Start the staleness clock for an empty folder. A folder already
    /// pending keeps its first-seen time; a completed one is left alone.
    pub fn mark_folder_pending(&mut self, folder: &str, first_seen: u64) -> bool {
        match folder_key(folder) {
            Some(day) => self.record(JournalEvent::AddPending { day, first_seen }),
            None => false,
        }
    }

    pub fn remove_folder_from_pending(&mut self, folder: &str) -> bool {
        match folder_key(folder) {
            Some(day) => self.record(JournalEvent::RemovePending(day)),
            None => false,
        }
    }

    pub fn should_promote_pending_to_completed(&self, folder: &str, now: u64) -> bool {
        folder_key(folder)
            .and_then(|day| self.data.pending_entry(day))
            .map_or(false, |p| {
                now.saturating_sub(p.first_seen) >= PENDING_FOLDER_TIMEOUT_SECONDS
            })
    }

    pub fn promote_pending_to_completed(&mut self, folder: &str) -> bool {
        if !self.is_pending_folder(folder) {
            return false;
        }
        log::info!("Promoted pending folder to completed: {} (empty for 7+ days)", folder);
        self.mark_folder_completed(folder)
    }

    pub fn completed_folders_count(&self) -> usize {
        self.data.completed.len()
    }

    pub fn pending_folders_count(&self) -> usize {
        self.data.pending.len()
    }

    /// Number of day folders found by the last scan, for progress reporting.
    pub fn set_total_folders_count(&mut self, count: usize) {
        self.total_folders = count;
    }

    pub fn incomplete_folders_count(&self) -> usize {
        if self.total_folders == 0 {
            return 0;
        }
        self.total_folders
            .saturating_sub(self.data.completed.len())
            .saturating_sub(self.data.pending.len())
    }

    // ------------------------------------------------------------------
    // File fingerprints
    // ------------------------------------------------------------------

    /// Whether `path` on `card` differs from what was last uploaded.
    ///
    /// Size is compared first; the content hash is only recomputed for
    /// MD5-tracked files of unchanged size. A file that cannot be hashed is
    /// reported as changed so it gets another upload attempt.
    pub fn has_file_changed(&self, card: &dyn FileSystem, path: &str, size: u64) -> bool {
        let entry = match self.data.files.get(PathHash::of_path(path)) {
            Some(entry) => entry,
            None => return true,
        };
        if entry.size != size {
            return true;
        }
        let stored = match entry.md5 {
            Some(md5) => md5,
            None => return false,
        };
        match md5_of_file(card, path) {
            Ok(current) => current != stored,
            Err(e) => {
                log::warn!("Cannot checksum {}, treating as changed: {}", path, e);
                true
            }
        }
    }

    /// Record a successful upload. `md5` selects content tracking; without
    /// it the file is tracked by size only.
    pub fn mark_file_uploaded(&mut self, path: &str, size: u64, md5: Option<[u8; 16]>) -> bool {
        let hash = PathHash::of_path(path);
        let entry = match md5 {
            Some(md5) => FileFingerprint::with_md5(hash, size, md5),
            None => FileFingerprint::size_only(hash, size),
        };
        self.record(JournalEvent::SetFile(entry))
    }

    pub fn forget_file(&mut self, path: &str) -> bool {
        self.record(JournalEvent::RemoveFile(PathHash::of_path(path)))
    }

    pub fn file_fingerprint(&self, path: &str) -> Option<&FileFingerprint> {
        self.data.files.get(PathHash::of_path(path))
    }

    pub fn tracked_files_count(&self) -> usize {
        self.data.files.len()
    }

    // ------------------------------------------------------------------
    // Retry and timestamp
    // ------------------------------------------------------------------

    pub fn current_retry_count(&self) -> u32 {
        self.data.retry.count
    }

    pub fn current_retry_folder(&self) -> Option<DayKey> {
        Some(self.data.retry.day).filter(|d| !d.is_none())
    }

    /// Track `folder` for retries. Switching folders resets the count.
    pub fn set_current_retry_folder(&mut self, folder: &str) -> bool {
        match folder_key(folder) {
            Some(day) if day != self.data.retry.day => {
                self.record(JournalEvent::SetRetry(RetryState { day, count: 0 }))
            }
            _ => false,
        }
    }

    pub fn increment_current_retry_count(&mut self) -> bool {
        if !self.data.retry.is_active() {
            return false;
        }
        let retry = RetryState {
            day: self.data.retry.day,
            count: self.data.retry.count.saturating_add(1),
        };
        self.record(JournalEvent::SetRetry(retry))
    }

    pub fn clear_current_retry(&mut self) -> bool {
        self.record(JournalEvent::SetRetry(RetryState::default()))
    }

    pub fn last_upload_timestamp(&self) -> u64 {
        self.data.last_upload_timestamp
    }

    pub fn set_last_upload_timestamp(&mut self, ts: u64) -> bool {
        self.record(JournalEvent::SetTimestamp(ts))
    }
}

fn folder_key(folder: &str) -> Option<DayKey> {
    match DayKey::from_folder(folder) {
        Ok(day) => Some(day),
        Err(e) => {
            log::warn!("Ignoring folder '{}': {}", folder, e);
            None
        }
    }
}

fn read_optional(fs: &dyn FileSystem, path: &str) -> Result<Option<Vec<u8>>, StateError> {
    match fs.read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => {
            log::error!("Failed to read {}: {}", path, e);
            Err(e.into())
        }
    }
}

fn discard_temp(fs: &dyn FileSystem) {
    if let Err(e) = remove_if_exists(fs, TEMP_PATH) {
        log::warn!("Failed to discard temp snapshot: {}", e);
    }
}

/// MD5 of a file's full contents.
pub fn md5_of_file(fs: &dyn FileSystem, path: &str) -> Result<[u8; 16], StorageError> {
    let data = fs.read(path)?;
    let digest = Md5::digest(&data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::FaultOp;
    use crate::storage::MemoryFileSystem;

    fn small_limits() -> StoreLimits {
        StoreLimits {
            max_completed: 3,
            max_pending: 2,
            max_files: 3,
            journal_max_lines: 5,
            journal_max_bytes: 4096,
        }
    }

    fn mem_store(limits: StoreLimits) -> (Arc<MemoryFileSystem>, UploadStateStore) {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = UploadStateStore::new(fs.clone(), limits);
        (fs, store)
    }

    fn reload(fs: &Arc<MemoryFileSystem>, limits: StoreLimits) -> UploadStateStore {
        UploadStateStore::open(fs.clone(), limits).unwrap()
    }

    #[test]
    fn test_first_boot_is_empty() {
        let (_fs, mut store) = mem_store(StoreLimits::default());
        let report = store.load().unwrap();
        assert!(report.first_boot);
        assert_eq!(store.completed_folders_count(), 0);
        assert_eq!(store.last_upload_timestamp(), 0);
    }

    #[test]
    fn test_round_trip_after_save() {
        let limits = StoreLimits::default();
        let (fs, mut store) = mem_store(limits);

        store.mark_folder_completed("20250101");
        store.mark_folder_completed("20250102");
        store.mark_folder_pending("20250103", 1_700_000_000);
        store.mark_file_uploaded("/DATALOG/20250102/BRP.edf", 4096, None);
        store.mark_file_uploaded("/SETTINGS/settings.ini", 512, Some([7; 16]));
        // a recent completed folder being re-checked keeps its retry context
        store.set_current_retry_folder("20250102");
        store.increment_current_retry_count();
        store.set_last_upload_timestamp(1_700_000_100);
        store.save().unwrap();

        // more deltas on top of the first snapshot, journal only
        store.remove_folder_from_completed("20250101");
        store.forget_file("/SETTINGS/settings.ini");
        store.save().unwrap();

        let reloaded = reload(&fs, limits);
        assert_eq!(reloaded.data(), store.data());
        assert_eq!(
            reloaded.current_retry_folder().unwrap().to_string(),
            "20250102"
        );
        assert_eq!(reloaded.current_retry_count(), 1);
    }

    #[test]
    fn test_retry_on_completed_folder_survives_compaction() {
        let limits = StoreLimits::default();
        let (fs, mut store) = mem_store(limits);

        store.mark_folder_completed("20250105");
        store.set_current_retry_folder("20250105");
        store.increment_current_retry_count();
        store.increment_current_retry_count();
        store.compact().unwrap();
        assert!(!fs.exists(JOURNAL_PATH) || fs.read(JOURNAL_PATH).unwrap().is_empty());

        let reloaded = reload(&fs, limits);
        assert_eq!(reloaded.data(), store.data());
        assert!(reloaded.is_folder_completed("20250105"));
        assert_eq!(
            reloaded.current_retry_folder().unwrap().to_string(),
            "20250105"
        );
        assert_eq!(reloaded.current_retry_count(), 2);
    }

    #[test]
    fn test_snapshot_retry_line_before_completed_is_kept() {
        let fs = Arc::new(MemoryFileSystem::new());
        let text = format!(
            "{}\nR|20250106|3\nC|20250106\n",
            SnapshotHeader {
                version: SNAPSHOT_VERSION,
                last_upload_timestamp: 0,
            }
            .to_line()
        );
        fs.write(SNAPSHOT_PATH, text.as_bytes()).unwrap();

        let store = reload(&fs, StoreLimits::default());
        assert!(store.is_folder_completed("20250106"));
        assert_eq!(store.current_retry_count(), 3);
    }

    #[test]
    fn test_journal_replay_order() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write(JOURNAL_PATH, b"P+|20250101|100\nP-|20250101\nC+|20250101\n")
            .unwrap();

        let store = reload(&fs, StoreLimits::default());
        assert!(store.is_folder_completed("20250101"));
        assert!(!store.is_pending_folder("20250101"));
        assert_eq!(store.pending_folders_count(), 0);
    }

    #[test]
    fn test_completing_clears_pending_and_retry() {
        let (_fs, mut store) = mem_store(StoreLimits::default());
        store.mark_folder_pending("20250101", 100);
        store.set_current_retry_folder("20250101");
        store.increment_current_retry_count();

        store.mark_folder_completed("20250101");
        assert!(!store.is_pending_folder("20250101"));
        assert!(store.current_retry_folder().is_none());
        assert_eq!(store.current_retry_count(), 0);

        // completed days cannot go back to pending without removal
        assert!(!store.mark_folder_pending("20250101", 200));
    }

    #[test]
    fn test_invalid_day_is_noop() {
        let (_fs, mut store) = mem_store(StoreLimits::default());
        assert!(!store.mark_folder_completed("2025010"));
        assert!(!store.mark_folder_pending("0", 1));
        assert_eq!(store.completed_folders_count(), 0);
        assert_eq!(store.queued_events(), 0);
    }

    #[test]
    fn test_new_file_detected() {
        let (_fs, store) = mem_store(StoreLimits::default());
        let card = MemoryFileSystem::new();
        card.write("/SETTINGS/settings.ini", &[0u8; 512]).unwrap();
        assert!(store.has_file_changed(&card, "/SETTINGS/settings.ini", 512));
    }

    #[test]
    fn test_change_detection_by_size_and_md5() {
        let (_fs, mut store) = mem_store(StoreLimits::default());
        let card = MemoryFileSystem::new();
        card.write("/SETTINGS/settings.ini", b"alpha").unwrap();
        card.write("/DATALOG/20250101/BRP.edf", b"0123456789").unwrap();

        let md5 = md5_of_file(&card, "/SETTINGS/settings.ini").unwrap();
        store.mark_file_uploaded("/SETTINGS/settings.ini", 5, Some(md5));
        store.mark_file_uploaded("/DATALOG/20250101/BRP.edf", 10, None);

        assert!(!store.has_file_changed(&card, "/SETTINGS/settings.ini", 5));
        assert!(!store.has_file_changed(&card, "/DATALOG/20250101/BRP.edf", 10));
        assert!(store.has_file_changed(&card, "/DATALOG/20250101/BRP.edf", 11));

        // same size, different content
        card.write("/SETTINGS/settings.ini", b"bravo").unwrap();
        assert!(store.has_file_changed(&card, "/SETTINGS/settings.ini", 5));
    }

    #[test]
    fn test_unreadable_tracked_file_counts_as_changed() {
        let (_fs, mut store) = mem_store(StoreLimits::default());
        let card = MemoryFileSystem::new();
        store.mark_file_uploaded("/SETTINGS/settings.ini", 5, Some([1; 16]));
        card.write("/SETTINGS/settings.ini", b"alpha").unwrap();
        card.inject_fault(FaultOp::Read, "settings.ini");
        assert!(store.has_file_changed(&card, "/SETTINGS/settings.ini", 5));
    }

    #[test]
    fn test_capacity_eviction_forces_compaction() {
        let limits = small_limits();
        let (fs, mut store) = mem_store(limits);

        store.mark_folder_completed("20250101");
        store.mark_folder_completed("20250102");
        store.mark_folder_completed("20250103");
        store.save().unwrap();
        assert!(!store.is_compaction_forced());

        store.mark_folder_completed("20250104");
        assert!(store.is_compaction_forced());
        assert!(!store.is_folder_completed("20250101"));
        assert_eq!(store.completed_folders_count(), 3);

        let report = store.save().unwrap();
        assert!(report.compacted);
        assert!(!store.is_compaction_forced());
        assert!(!fs.exists(JOURNAL_PATH));

        let reloaded = reload(&fs, limits);
        assert!(!reloaded.is_folder_completed("20250101"));
        assert!(reloaded.is_folder_completed("20250104"));
    }

    #[test]
    fn test_pending_aging_boundary() {
        let (_fs, mut store) = mem_store(StoreLimits::default());
        let now = 1_800_000_000;
        store.mark_folder_pending("20250101", now - (7 * 86400 + 1));
        store.mark_folder_pending("20250102", now - (7 * 86400 - 1));

        assert!(store.should_promote_pending_to_completed("20250101", now));
        assert!(!store.should_promote_pending_to_completed("20250102", now));
        assert!(!store.should_promote_pending_to_completed("20250105", now));

        assert!(store.promote_pending_to_completed("20250101"));
        assert!(store.is_folder_completed("20250101"));
        assert!(!store.promote_pending_to_completed("20250105"));
    }

    #[test]
    fn test_retry_tracking() {
        let (_fs, mut store) = mem_store(StoreLimits::default());
        store.set_current_retry_folder("20250101");
        store.increment_current_retry_count();
        store.increment_current_retry_count();
        assert_eq!(store.current_retry_count(), 2);

        // same folder keeps the count
        store.set_current_retry_folder("20250101");
        assert_eq!(store.current_retry_count(), 2);

        store.set_current_retry_folder("20250102");
        assert_eq!(store.current_retry_count(), 0);

        store.clear_current_retry();
        assert!(store.current_retry_folder().is_none());
        assert!(!store.increment_current_retry_count());
    }

    #[test]
    fn test_journal_growth_triggers_compaction() {
        let limits = small_limits();
        let (fs, mut store) = mem_store(limits);
        store.save().unwrap();
        assert!(fs.exists(SNAPSHOT_PATH));

        for ts in 1..=5 {
            store.set_last_upload_timestamp(ts);
            assert!(!store.save().unwrap().compacted);
        }
        assert_eq!(store.journal_line_count(), 5);

        store.set_last_upload_timestamp(6);
        assert!(store.save().unwrap().compacted);
        assert_eq!(store.journal_line_count(), 0);
        assert!(fs.read_to_string(SNAPSHOT_PATH).unwrap().starts_with("U2|1|6\n"));
    }

    #[test]
    fn test_failed_append_keeps_queue_and_files() {
        let limits = StoreLimits::default();
        let (fs, mut store) = mem_store(limits);
        store.mark_folder_completed("20250101");
        store.save().unwrap();
        let snapshot_before = fs.read_to_string(SNAPSHOT_PATH);

        fs.inject_fault(FaultOp::Append, JOURNAL_PATH);
        store.mark_folder_completed("20250102");
        assert!(store.save().is_err());
        assert_eq!(store.queued_events(), 1);
        assert_eq!(fs.read_to_string(SNAPSHOT_PATH), snapshot_before);
        assert!(!fs.exists(JOURNAL_PATH));

        fs.clear_faults();
        assert_eq!(store.save().unwrap().appended, 1);
        assert!(reload(&fs, limits).is_folder_completed("20250102"));
    }

    #[test]
    fn test_failed_compaction_leaves_prior_state_authoritative() {
        let limits = small_limits();
        let (fs, mut store) = mem_store(limits);
        store.mark_folder_completed("20250101");
        store.save().unwrap();

        fs.inject_fault(FaultOp::Write, TEMP_PATH);
        for day in ["20250102", "20250103", "20250104"] {
            store.mark_folder_completed(day);
        }
        let report = store.save().unwrap();
        assert!(!report.compacted);
        assert!(store.is_compaction_forced());
        assert!(!fs.exists(TEMP_PATH));

        // the journal carries the update even though compaction failed
        let reloaded = reload(&fs, limits);
        assert_eq!(reloaded.data(), store.data());

        fs.clear_faults();
        assert!(store.save().unwrap().compacted);
    }

    #[test]
    fn test_interrupted_compaction_recovers_temp() {
        let limits = StoreLimits::default();
        let (fs, mut store) = mem_store(limits);
        store.mark_folder_completed("20250101");
        store.save().unwrap();

        // simulate power loss after deleting the snapshot but before rename
        fs.inject_fault(FaultOp::Rename, TEMP_PATH);
        store.mark_folder_completed("20250102");
        assert!(store.compact().is_err());
        assert!(!fs.exists(SNAPSHOT_PATH));
        assert!(fs.exists(TEMP_PATH));
        fs.clear_faults();

        let reloaded = reload(&fs, limits);
        assert!(reloaded.is_folder_completed("20250101"));
        assert!(reloaded.is_folder_completed("20250102"));
        assert!(fs.exists(SNAPSHOT_PATH));
        assert!(!fs.exists(TEMP_PATH));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.write(
            SNAPSHOT_PATH,
            b"U2|1|500\nR|0|0\nC|20250101\nC|2025010\ngarbage\nP|20250102|100\n",
        )
        .unwrap();
        fs.write(JOURNAL_PATH, b"C+|20250103\nC+|bad\nT|900\nC+|2025").unwrap();

        let mut store = UploadStateStore::new(fs.clone(), StoreLimits::default());
        let report = store.load().unwrap();
        assert_eq!(report.skipped_lines, 4);
        assert!(store.is_folder_completed("20250101"));
        assert!(store.is_folder_completed("20250103"));
        assert!(store.is_pending_folder("20250102"));
        assert_eq!(store.last_upload_timestamp(), 900);
    }

    #[test]
    fn test_read_failure_keeps_memory_state() {
        let limits = StoreLimits::default();
        let (fs, mut store) = mem_store(limits);
        store.mark_folder_completed("20250101");
        store.save().unwrap();

        fs.inject_fault(FaultOp::Read, SNAPSHOT_PATH);
        assert!(store.load().is_err());
        assert!(store.is_folder_completed("20250101"));
    }

    #[test]
    fn test_deferred_reset() {
        let limits = StoreLimits::default();
        let (fs, mut store) = mem_store(limits);
        store.mark_folder_completed("20250101");
        store.set_last_upload_timestamp(5);
        store.save().unwrap();
        store.set_last_upload_timestamp(6);
        store.save().unwrap();

        UploadStateStore::request_reset(fs.as_ref()).unwrap();
        // nothing is wiped until the next boot processes the marker
        assert!(reload(&fs, limits).is_folder_completed("20250101"));

        assert!(UploadStateStore::process_pending_reset(fs.as_ref()).unwrap());
        assert!(!UploadStateStore::process_pending_reset(fs.as_ref()).unwrap());
        let mut fresh = UploadStateStore::new(fs.clone(), limits);
        assert!(fresh.load().unwrap().first_boot);
    }

    #[test]
    fn test_local_file_system_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn FileSystem> =
            Arc::new(crate::storage::LocalFileSystem::new(dir.path()).unwrap());
        let limits = StoreLimits::default();

        let mut store = UploadStateStore::new(fs.clone(), limits);
        store.mark_folder_completed("20250101");
        store.mark_file_uploaded("/DATALOG/20250101/BRP.edf", 1, None);
        store.save().unwrap();
        store.mark_folder_pending("20250102", 77);
        store.save().unwrap();

        let reloaded = UploadStateStore::open(fs, limits).unwrap();
        assert_eq!(reloaded.data(), store.data());
        assert!(dir.path().join("upload_state.jnl").exists());
    }
}
