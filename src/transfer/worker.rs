use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::backend::UploadBackend;
use super::budget::TimeBudget;
use super::TransferError;
use crate::clock::{local_time, Clock};
use crate::config::ControllerConfig;
use crate::network::NetworkGuard;
use crate::state::store::md5_of_file;
use crate::state::{DayKey, UploadStateStore};
use crate::storage::{join_path, DirEntry, FileSystem};
use crate::supervisor::{TransferResult, TransferWorker, WorkerContext};

pub const DATALOG_DIR: &str = "/DATALOG";
pub const SETTINGS_DIR: &str = "/SETTINGS";

/// Consecutive failed folders after which the session gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub session_budget: Duration,
    pub max_retry_attempts: u32,
    pub recent_folder_days: u32,
    pub max_days: u32,
    pub gmt_offset_seconds: i32,
}

impl From<&ControllerConfig> for WorkerConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            session_budget: config.exclusive_access(),
            max_retry_attempts: config.max_retry_attempts,
            recent_folder_days: config.recent_folder_days,
            max_days: config.max_days,
            gmt_offset_seconds: config.gmt_offset_seconds(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

#[derive(Debug, Default)]
struct FolderOutcome {
    uploaded: usize,
    skipped_unchanged: usize,
    out_of_budget: bool,
}

#[derive(Debug, Default)]
struct SessionStats {
    uploaded: usize,
    failed_folders: usize,
    out_of_budget: bool,
}

/// Uploads new and changed card files, one session per call.
pub struct UploadWorker {
    card: Arc<dyn FileSystem>,
    backend: Arc<dyn UploadBackend>,
    guard: Arc<NetworkGuard>,
    config: WorkerConfig,
}

impl UploadWorker {
    pub fn new(
        card: Arc<dyn FileSystem>,
        backend: Arc<dyn UploadBackend>,
        guard: Arc<NetworkGuard>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            card,
            backend,
            guard,
            config,
        }
    }

    /// Oldest day still considered recent, if the clock allows telling.
    fn day_cutoff(&self, clock: &dyn Clock, days: u32) -> Option<DayKey> {
        if days == 0 || !clock.is_time_valid() {
            return None;
        }
        let then = clock.unix_time().saturating_sub(days as u64 * 86_400);
        Some(DayKey::from_date(
            local_time(then, self.config.gmt_offset_seconds).date(),
        ))
    }

    fn is_recent(&self, clock: &dyn Clock, day: DayKey) -> bool {
        self.day_cutoff(clock, self.config.recent_folder_days)
            .map_or(false, |cutoff| day >= cutoff)
    }

    fn list_files(&self, dir: &str) -> Result<Vec<DirEntry>, TransferError> {
        Ok(self
            .card
            .list_dir(dir)?
            .into_iter()
            .filter(|e| !e.is_dir)
            .collect())
    }

    /// Day folders that need a visit this session, newest first.
    fn scan_folders(
        &self,
        store: &mut UploadStateStore,
        clock: &dyn Clock,
    ) -> Result<Vec<DayKey>, TransferError> {
        let entries = match self.card.list_dir(DATALOG_DIR) {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => {
                log::warn!("No {} folder on the card", DATALOG_DIR);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let oldest = self.day_cutoff(clock, self.config.max_days);
        let now = clock.unix_time();
        let mut eligible = 0;
        let mut folders = Vec::new();

        for entry in entries.iter().filter(|e| e.is_dir) {
            let day = match DayKey::from_folder(&entry.name) {
                Ok(day) => day,
                Err(_) => {
                    log::debug!("Ignoring non-day folder {}", entry.name);
                    continue;
                }
            };
            if oldest.map_or(false, |cutoff| day < cutoff) {
                continue;
            }
            eligible += 1;
            let name = day.to_string();

            if store.is_folder_completed(&name) {
                if self.is_recent(clock, day) {
                    log::debug!("Re-checking recent completed folder {}", name);
                    folders.push(day);
                }
            } else if store.is_pending_folder(&name) {
                let files = self.list_files(&join_path(DATALOG_DIR, &name))?;
                if !files.is_empty() {
                    log::debug!("Pending folder {} now has files", name);
                    store.remove_folder_from_pending(&name);
                    folders.push(day);
                } else if clock.is_time_valid()
                    && store.should_promote_pending_to_completed(&name, now)
                {
                    folders.push(day);
                }
            } else {
                folders.push(day);
            }
        }

        folders.sort_unstable_by(|a, b| b.cmp(a));
        store.set_total_folders_count(eligible);
        log::info!(
            "Scan: {} folders to visit ({} eligible)",
            folders.len(),
            eligible
        );
        Ok(folders)
    }

    /// Upload one file, cycling the link once on failure.
    async fn upload_with_recovery(
        &self,
        ctx: &WorkerContext,
        path: &str,
    ) -> Result<u64, TransferError> {
        match self.backend.upload(self.card.as_ref(), path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                log::warn!("Upload of {} failed: {}", path, e);
                let beat = || ctx.heartbeat();
                if !self.guard.try_cycle(&beat).await {
                    return Err(TransferError::LinkDown);
                }
                if ctx.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                ctx.heartbeat();
                self.backend.upload(self.card.as_ref(), path).await
            }
        }
    }

    async fn upload_folder(
        &self,
        store: &mut UploadStateStore,
        ctx: &WorkerContext,
        budget: &mut TimeBudget,
        day: DayKey,
    ) -> Result<FolderOutcome, TransferError> {
        let clock = Arc::clone(ctx.clock());
        let name = day.to_string();
        let dir = join_path(DATALOG_DIR, &name);
        let files = self.list_files(&dir)?;
        let mut outcome = FolderOutcome::default();

        if files.is_empty() {
            if !clock.is_time_valid() {
                log::debug!("Clock not set, leaving empty folder {} alone", name);
                return Ok(outcome);
            }
            let now = clock.unix_time();
            if store.is_pending_folder(&name) {
                if store.should_promote_pending_to_completed(&name, now) {
                    store.promote_pending_to_completed(&name);
                    log_save(store);
                }
            } else if !store.is_folder_completed(&name) {
                store.mark_folder_pending(&name, now);
                log::debug!("Marked empty folder {} as pending", name);
                log_save(store);
            }
            return Ok(outcome);
        }

        let recent = self.is_recent(clock.as_ref(), day);
        let rescan = recent && store.is_folder_completed(&name);

        for file in &files {
            if ctx.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            ctx.heartbeat();
            let path = join_path(&dir, &file.name);

            let tracked = store.file_fingerprint(&path).is_some();
            if (rescan || tracked) && !store.has_file_changed(self.card.as_ref(), &path, file.size)
            {
                outcome.skipped_unchanged += 1;
                continue;
            }
            if file.size == 0 {
                log::warn!("File is empty: {}", path);
                if recent {
                    store.mark_file_uploaded(&path, 0, None);
                }
                continue;
            }
            if !budget.can_upload(file.size, clock.now_ms()) {
                log::info!("Session budget exhausted before {}", path);
                outcome.out_of_budget = true;
                log_save(store);
                return Ok(outcome);
            }

            let started = clock.now_ms();
            let bytes = match self.upload_with_recovery(ctx, &path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Failed to upload {}: {}", path, e);
                    log_save(store);
                    return Err(e);
                }
            };
            budget.record_upload(bytes, clock.now_ms().saturating_sub(started));
            if recent {
                store.mark_file_uploaded(&path, file.size, None);
            }
            outcome.uploaded += 1;
        }

        if rescan {
            log::info!(
                "Re-scan of {}: {} uploaded, {} unchanged",
                name,
                outcome.uploaded,
                outcome.skipped_unchanged
            );
        } else {
            log::info!("Uploaded all {} files in {}", outcome.uploaded, name);
        }
        store.mark_folder_completed(&name);
        log_save(store);
        Ok(outcome)
    }

    /// Root-level and settings files, tracked by content hash.
    async fn upload_support_files(
        &self,
        store: &mut UploadStateStore,
        ctx: &WorkerContext,
    ) -> Result<usize, TransferError> {
        let mut paths: Vec<(String, u64)> = Vec::new();
        for dir in ["/", SETTINGS_DIR] {
            match self.list_files(dir) {
                Ok(files) => paths.extend(
                    files
                        .into_iter()
                        .map(|f| (join_path(dir, &f.name), f.size)),
                ),
                Err(TransferError::Storage(e)) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut uploaded = 0;
        for (path, size) in paths {
            if ctx.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            ctx.heartbeat();
            if !store.has_file_changed(self.card.as_ref(), &path, size) {
                continue;
            }
            self.upload_with_recovery(ctx, &path).await?;
            match md5_of_file(self.card.as_ref(), &path) {
                Ok(md5) => {
                    store.mark_file_uploaded(&path, size, Some(md5));
                }
                Err(e) => log::warn!("Uploaded {} but could not fingerprint it: {}", path, e),
            }
            uploaded += 1;
        }
        Ok(uploaded)
    }

    fn retries_exhausted(&self, store: &UploadStateStore, day: DayKey) -> bool {
        store.current_retry_folder() == Some(day)
            && store.current_retry_count() >= self.config.max_retry_attempts
    }
}

fn log_save(store: &mut UploadStateStore) {
    if let Err(e) = store.save() {
        log::error!("Failed to save upload state: {}", e);
    }
}

#[async_trait]
impl TransferWorker for UploadWorker {
    async fn run(&self, store: &mut UploadStateStore, ctx: &WorkerContext) -> TransferResult {
        ctx.heartbeat();
        let clock = Arc::clone(ctx.clock());

        if !self.guard.is_connected() {
            log::error!("Network link down, cannot upload");
            return TransferResult::Error;
        }
        let _session = self
            .backend
            .is_stateful()
            .then(|| self.guard.begin_session());

        let mut budget = TimeBudget::new();
        budget.start_session(clock.now_ms(), self.config.session_budget);
        log::info!(
            "Upload session started ({}s budget, backend {})",
            self.config.session_budget.as_secs(),
            self.backend.name()
        );

        let folders = match self.scan_folders(store, clock.as_ref()) {
            Ok(folders) => folders,
            Err(e) => {
                log::error!("Cannot scan {}: {}", DATALOG_DIR, e);
                log_save(store);
                return TransferResult::Error;
            }
        };

        let mut stats = SessionStats::default();
        let mut consecutive_failures = 0;

        for day in folders {
            if ctx.is_cancelled() {
                log::warn!("Upload session cancelled");
                return TransferResult::Error;
            }
            if !budget.has_budget(clock.now_ms()) {
                stats.out_of_budget = true;
                break;
            }
            if self.retries_exhausted(store, day) {
                log::warn!(
                    "Folder {} failed {} times, skipping this session",
                    day,
                    store.current_retry_count()
                );
                // next session starts the folder over with a fresh count
                store.clear_current_retry();
                continue;
            }

            match self.upload_folder(store, ctx, &mut budget, day).await {
                Ok(outcome) => {
                    consecutive_failures = 0;
                    stats.uploaded += outcome.uploaded;
                    if outcome.out_of_budget {
                        stats.out_of_budget = true;
                        break;
                    }
                }
                Err(TransferError::Cancelled) => {
                    log::warn!("Upload session cancelled");
                    return TransferResult::Error;
                }
                Err(e) => {
                    log::warn!("Folder {} had errors: {}", day, e);
                    stats.failed_folders += 1;
                    consecutive_failures += 1;
                    let name = day.to_string();
                    store.set_current_retry_folder(&name);
                    store.increment_current_retry_count();
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        log::warn!(
                            "{} folders failed in a row, ending session early",
                            consecutive_failures
                        );
                        break;
                    }
                }
            }
        }

        if stats.uploaded > 0 && !stats.out_of_budget {
            match self.upload_support_files(store, ctx).await {
                Ok(count) => stats.uploaded += count,
                Err(e) => {
                    log::warn!("Support file upload failed: {}", e);
                    stats.failed_folders += 1;
                }
            }
        }

        if stats.uploaded > 0 && clock.is_time_valid() {
            store.set_last_upload_timestamp(clock.unix_time());
        }
        log_save(store);

        let result = if stats.out_of_budget && store.incomplete_folders_count() > 0 {
            TransferResult::Timeout
        } else if stats.failed_folders > 0 {
            TransferResult::Error
        } else if stats.uploaded > 0 {
            TransferResult::Complete
        } else {
            TransferResult::NothingToDo
        };
        log::info!(
            "Upload session ended: {:?} ({} files, {} failed folders)",
            result,
            stats.uploaded,
            stats.failed_folders
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::network::{GuardConfig, SimulatedLink};
    use crate::state::StoreLimits;
    use crate::storage::MemoryFileSystem;
    use crate::transfer::DirectoryBackend;
    use std::sync::Mutex;

    /// 2025-01-10 12:00:00 UTC
    const NOW: u64 = 1_736_510_400;

    struct FlakyBackend {
        inner: DirectoryBackend,
        fail_fragment: Mutex<Option<String>>,
        attempts: Mutex<Vec<String>>,
    }

    impl FlakyBackend {
        fn new(dest: Arc<MemoryFileSystem>) -> Self {
            Self {
                inner: DirectoryBackend::new(dest),
                fail_fragment: Mutex::new(None),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn fail_on(&self, fragment: &str) {
            *self.fail_fragment.lock().unwrap() = Some(fragment.to_string());
        }

        fn recover(&self) {
            *self.fail_fragment.lock().unwrap() = None;
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UploadBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn upload(&self, card: &dyn FileSystem, path: &str) -> Result<u64, TransferError> {
            self.attempts.lock().unwrap().push(path.to_string());
            let fail = self
                .fail_fragment
                .lock()
                .unwrap()
                .as_ref()
                .map_or(false, |f| path.contains(f.as_str()));
            if fail {
                return Err(TransferError::BackendError {
                    backend: "flaky".to_string(),
                    reason: "refused".to_string(),
                });
            }
            self.inner.upload(card, path).await
        }
    }

    struct Rig {
        card: Arc<MemoryFileSystem>,
        dest: Arc<MemoryFileSystem>,
        flash: Arc<MemoryFileSystem>,
        clock: Arc<ManualClock>,
        backend: Arc<FlakyBackend>,
        link: SimulatedLink,
        worker: UploadWorker,
        store: UploadStateStore,
    }

    impl Rig {
        fn new(config: WorkerConfig) -> Self {
            let card = Arc::new(MemoryFileSystem::new());
            let dest = Arc::new(MemoryFileSystem::new());
            let flash = Arc::new(MemoryFileSystem::new());
            let backend = Arc::new(FlakyBackend::new(dest.clone()));
            let link = SimulatedLink::new(Duration::from_millis(200));
            let guard = Arc::new(NetworkGuard::new(Arc::new(link.clone()), GuardConfig::default()));
            let worker = UploadWorker::new(card.clone(), backend.clone(), guard, config);
            let store = UploadStateStore::new(flash.clone(), StoreLimits::default());
            Self {
                card,
                dest,
                flash,
                clock: Arc::new(ManualClock::new(NOW)),
                backend,
                link,
                worker,
                store,
            }
        }

        async fn run(&mut self) -> TransferResult {
            let ctx = WorkerContext::new(self.clock.clone());
            self.worker.run(&mut self.store, &ctx).await
        }
    }

    fn old_card(card: &MemoryFileSystem) {
        card.write("/DATALOG/20241201/BRP.edf", &[1; 100]).unwrap();
        card.write("/DATALOG/20241201/PLD.edf", &[2; 50]).unwrap();
        card.write("/DATALOG/20241202/BRP.edf", &[3; 80]).unwrap();
        card.write("/SETTINGS/settings.ini", b"mode=auto").unwrap();
        card.write("/Identification.tgt", b"serial").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploads_new_folders_then_nothing_to_do() {
        let mut rig = Rig::new(WorkerConfig::default());
        old_card(&rig.card);

        assert_eq!(rig.run().await, TransferResult::Complete);
        assert!(rig.store.is_folder_completed("20241201"));
        assert!(rig.store.is_folder_completed("20241202"));
        assert_eq!(rig.store.last_upload_timestamp(), NOW);
        assert!(rig.dest.exists("/DATALOG/20241201/PLD.edf"));
        assert!(rig.dest.exists("/SETTINGS/settings.ini"));
        assert!(rig.dest.exists("/Identification.tgt"));

        // newest folder first
        let attempts = rig.backend.attempts();
        assert_eq!(attempts[0], "/DATALOG/20241202/BRP.edf");

        // state was persisted
        let reloaded = UploadStateStore::open(rig.flash.clone(), StoreLimits::default()).unwrap();
        assert!(reloaded.is_folder_completed("20241202"));

        assert_eq!(rig.run().await, TransferResult::NothingToDo);
        assert_eq!(rig.backend.attempts().len(), attempts.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_folder_goes_pending_then_completed() {
        let mut rig = Rig::new(WorkerConfig::default());
        rig.card.create_dir_all("/DATALOG/20250105").unwrap();

        assert_eq!(rig.run().await, TransferResult::NothingToDo);
        assert!(rig.store.is_pending_folder("20250105"));

        rig.clock.set_unix_time(NOW + 3 * 86_400);
        assert_eq!(rig.run().await, TransferResult::NothingToDo);
        assert!(rig.store.is_pending_folder("20250105"));

        rig.clock.set_unix_time(NOW + 7 * 86_400);
        assert_eq!(rig.run().await, TransferResult::NothingToDo);
        assert!(rig.store.is_folder_completed("20250105"));
        assert!(!rig.store.is_pending_folder("20250105"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_folder_ignored_without_valid_clock() {
        let mut rig = Rig::new(WorkerConfig::default());
        rig.clock.set_unix_time(3600);
        rig.card.create_dir_all("/DATALOG/20250105").unwrap();

        assert_eq!(rig.run().await, TransferResult::NothingToDo);
        assert!(!rig.store.is_pending_folder("20250105"));
        assert_eq!(rig.store.queued_events(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_folder_with_new_files_is_uploaded() {
        let mut rig = Rig::new(WorkerConfig::default());
        rig.store.mark_folder_pending("20250105", NOW - 86_400);
        rig.card.write("/DATALOG/20250105/EVE.edf", &[9; 10]).unwrap();

        assert_eq!(rig.run().await, TransferResult::Complete);
        assert!(!rig.store.is_pending_folder("20250105"));
        assert!(rig.store.is_folder_completed("20250105"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_folder_rescan_uploads_only_changes() {
        let mut rig = Rig::new(WorkerConfig::default());
        rig.card.write("/DATALOG/20250110/BRP.edf", &[1; 100]).unwrap();
        rig.card.write("/DATALOG/20250110/CSL.edf", &[2; 10]).unwrap();

        assert_eq!(rig.run().await, TransferResult::Complete);
        assert!(rig.store.is_folder_completed("20250110"));
        assert!(rig
            .store
            .file_fingerprint("/DATALOG/20250110/BRP.edf")
            .is_some());
        let first = rig.backend.attempts().len();

        // the device keeps writing today's file
        rig.card.write("/DATALOG/20250110/BRP.edf", &[1; 150]).unwrap();
        assert_eq!(rig.run().await, TransferResult::Complete);
        let attempts = rig.backend.attempts();
        assert_eq!(&attempts[first..], &["/DATALOG/20250110/BRP.edf".to_string()]);

        assert_eq!(rig.run().await, TransferResult::NothingToDo);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_folder_skipped_then_retried_next_session() {
        let config = WorkerConfig {
            max_retry_attempts: 2,
            ..WorkerConfig::default()
        };
        let mut rig = Rig::new(config);
        rig.card.write("/DATALOG/20241202/BRP.edf", &[3; 80]).unwrap();
        rig.backend.fail_on("20241202");

        assert_eq!(rig.run().await, TransferResult::Error);
        assert_eq!(rig.store.current_retry_count(), 1);
        assert_eq!(
            rig.store.current_retry_folder().unwrap().to_string(),
            "20241202"
        );

        // cooldown passes the link cycle rate limit
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(rig.run().await, TransferResult::Error);
        assert_eq!(rig.store.current_retry_count(), 2);

        // out of attempts: skipped this session, counted afresh next time
        let before = rig.backend.attempts().len();
        assert_eq!(rig.run().await, TransferResult::NothingToDo);
        assert_eq!(rig.backend.attempts().len(), before);
        assert!(rig.link.cycles() >= 1);
        assert!(rig.store.current_retry_folder().is_none());
        assert_eq!(rig.store.current_retry_count(), 0);

        rig.backend.recover();
        assert_eq!(rig.run().await, TransferResult::Complete);
        assert!(rig.store.is_folder_completed("20241202"));
        assert!(rig.dest.exists("/DATALOG/20241202/BRP.edf"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_folder_fails_again_with_fresh_count() {
        let config = WorkerConfig {
            max_retry_attempts: 1,
            ..WorkerConfig::default()
        };
        let mut rig = Rig::new(config);
        rig.card.write("/DATALOG/20241203/BRP.edf", &[5; 40]).unwrap();
        rig.backend.fail_on("20241203");

        assert_eq!(rig.run().await, TransferResult::Error);
        assert_eq!(rig.store.current_retry_count(), 1);
        assert_eq!(rig.run().await, TransferResult::NothingToDo);

        // still broken: the folder is attempted once more before being skipped again
        let before = rig.backend.attempts().len();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(rig.run().await, TransferResult::Error);
        assert!(rig.backend.attempts().len() > before);
        assert_eq!(rig.store.current_retry_count(), 1);
        assert!(!rig.store.is_folder_completed("20241203"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failed_folders_end_session() {
        let mut rig = Rig::new(WorkerConfig::default());
        rig.card.write("/DATALOG/20241201/BRP.edf", &[1; 10]).unwrap();
        rig.card.write("/DATALOG/20241202/BRP.edf", &[1; 10]).unwrap();
        rig.card.write("/DATALOG/20241203/BRP.edf", &[1; 10]).unwrap();
        rig.backend.fail_on("/DATALOG/");

        assert_eq!(rig.run().await, TransferResult::Error);
        let attempts = rig.backend.attempts();
        assert!(attempts.iter().all(|p| !p.contains("20241201")));
        assert!(!rig.store.is_folder_completed("20241203"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovered_by_link_cycle() {
        struct OnceFailing {
            inner: DirectoryBackend,
            failed: Mutex<bool>,
        }

        #[async_trait]
        impl UploadBackend for OnceFailing {
            fn name(&self) -> &str {
                "once"
            }

            async fn upload(
                &self,
                card: &dyn FileSystem,
                path: &str,
            ) -> Result<u64, TransferError> {
                let first = !std::mem::replace(&mut *self.failed.lock().unwrap(), true);
                if first {
                    return Err(TransferError::BackendError {
                        backend: "once".to_string(),
                        reason: "socket reset".to_string(),
                    });
                }
                self.inner.upload(card, path).await
            }
        }

        let rig = Rig::new(WorkerConfig::default());
        rig.card.write("/DATALOG/20241202/BRP.edf", &[3; 80]).unwrap();
        let backend = Arc::new(OnceFailing {
            inner: DirectoryBackend::new(rig.dest.clone()),
            failed: Mutex::new(false),
        });
        let guard = Arc::new(NetworkGuard::new(Arc::new(rig.link.clone()), GuardConfig::default()));
        let worker = UploadWorker::new(rig.card.clone(), backend, guard, WorkerConfig::default());
        let mut store = UploadStateStore::new(rig.flash.clone(), StoreLimits::default());

        let ctx = WorkerContext::new(rig.clock.clone());
        assert_eq!(worker.run(&mut store, &ctx).await, TransferResult::Complete);
        assert_eq!(rig.link.cycles(), 1);
        assert!(store.is_folder_completed("20241202"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_times_out() {
        let config = WorkerConfig {
            session_budget: Duration::from_secs(1),
            ..WorkerConfig::default()
        };
        let mut rig = Rig::new(config);
        rig.card.write("/DATALOG/20241201/BRP.edf", &[1; 10]).unwrap();
        rig.card.write("/DATALOG/20241202/BRP.edf", &vec![1; 200 * 1024]).unwrap();

        assert_eq!(rig.run().await, TransferResult::Timeout);
        assert!(!rig.store.is_folder_completed("20241202"));
        assert_eq!(rig.store.incomplete_folders_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_is_an_error() {
        let mut rig = Rig::new(WorkerConfig::default());
        old_card(&rig.card);
        rig.link.set_connected(false);
        assert_eq!(rig.run().await, TransferResult::Error);
        assert!(rig.backend.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_session_stops() {
        let mut rig = Rig::new(WorkerConfig::default());
        old_card(&rig.card);
        let ctx = WorkerContext::new(rig.clock.clone());
        ctx.cancellation().cancel();
        assert_eq!(rig.worker.run(&mut rig.store, &ctx).await, TransferResult::Error);
        assert!(rig.backend.attempts().is_empty());
    }
}
