//! Transfer task supervision
//!
//! The transfer runs as its own tokio task so the control loop keeps
//! sampling the bus. The loop never awaits the task: it polls a oneshot for
//! the result and watches a heartbeat the worker refreshes between I/O
//! steps. A heartbeat older than the timeout means the task is wedged; it
//! is cancelled and aborted, a marker is left for the next boot, and the
//! caller is expected to restart.
//!
//! The state store moves into the task with the work and comes back with the
//! result. A hung task never returns it, so the restart reloads from disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::state::UploadStateStore;
use crate::storage::{remove_if_exists, FileSystem};

pub const WATCHDOG_MARKER_PATH: &str = "/watchdog_restart";
pub const DEFAULT_WATCHDOG_TIMEOUT_MS: u64 = 120_000;

/// How a transfer session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    /// Something was uploaded and nothing is left.
    Complete,
    /// The session budget ran out with work remaining.
    Timeout,
    Error,
    /// Nothing needed uploading.
    NothingToDo,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("A transfer is already running")]
    AlreadyRunning,

    #[error("Upload state is not available")]
    StoreUnavailable,

    #[error("No async runtime: {0}")]
    NoRuntime(String),
}

/// Handed to the worker: heartbeat and cancellation.
#[derive(Clone)]
pub struct WorkerContext {
    heartbeat: Arc<AtomicU64>,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl WorkerContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let heartbeat = Arc::new(AtomicU64::new(clock.now_ms()));
        Self {
            heartbeat,
            cancel: CancellationToken::new(),
            clock,
        }
    }

    /// Prove liveness to the supervisor.
    pub fn heartbeat(&self) {
        self.heartbeat.store(self.clock.now_ms(), Ordering::SeqCst);
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.heartbeat.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[async_trait]
pub trait TransferWorker: Send + Sync {
    /// Run one session while the uploader owns the card.
    async fn run(&self, store: &mut UploadStateStore, ctx: &WorkerContext) -> TransferResult;
}

/// What the control loop sees when it checks on the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    /// No transfer has been started.
    Idle,
    Running,
    Finished(TransferResult),
    /// Heartbeat went stale; the task was killed.
    Hung,
    /// The task ended without reporting (it panicked).
    Lost,
}

/// Non-blocking start/poll interface the state machine drives.
pub trait UploadRunner {
    fn start(&mut self) -> Result<(), SupervisorError>;

    fn poll(&mut self) -> RunnerStatus;
}

struct ActiveTransfer {
    handle: JoinHandle<()>,
    result_rx: oneshot::Receiver<(TransferResult, UploadStateStore)>,
    ctx: WorkerContext,
}

pub struct TransferSupervisor {
    worker: Arc<dyn TransferWorker>,
    clock: Arc<dyn Clock>,
    system_fs: Arc<dyn FileSystem>,
    timeout_ms: u64,
    store: Option<UploadStateStore>,
    active: Option<ActiveTransfer>,
}

impl TransferSupervisor {
    pub fn new(
        worker: Arc<dyn TransferWorker>,
        store: UploadStateStore,
        clock: Arc<dyn Clock>,
        system_fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            worker,
            clock,
            system_fs,
            timeout_ms: DEFAULT_WATCHDOG_TIMEOUT_MS,
            store: Some(store),
            active: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// The store, unless a transfer currently holds it.
    pub fn store(&self) -> Option<&UploadStateStore> {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> Option<&mut UploadStateStore> {
        self.store.as_mut()
    }

    fn record_watchdog_restart(&self, reason: &str) {
        let text = format!("{}\n", reason);
        if let Err(e) = self.system_fs.write(WATCHDOG_MARKER_PATH, text.as_bytes()) {
            log::error!("Failed to write watchdog marker: {}", e);
        }
    }

    fn kill(&mut self, active: ActiveTransfer, reason: &str) {
        active.ctx.cancellation().cancel();
        active.handle.abort();
        log::error!("Transfer task killed: {}", reason);
        self.record_watchdog_restart(reason);
    }
}

impl UploadRunner for TransferSupervisor {
    fn start(&mut self) -> Result<(), SupervisorError> {
        if self.active.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SupervisorError::NoRuntime(e.to_string()))?;
        let mut store = self.store.take().ok_or(SupervisorError::StoreUnavailable)?;

        let ctx = WorkerContext::new(Arc::clone(&self.clock));
        let (result_tx, result_rx) = oneshot::channel();
        let worker = Arc::clone(&self.worker);
        let task_ctx = ctx.clone();

        let handle = runtime.spawn(async move {
            let result = worker.run(&mut store, &task_ctx).await;
            let _ = result_tx.send((result, store));
        });

        log::info!("Transfer task started");
        self.active = Some(ActiveTransfer {
            handle,
            result_rx,
            ctx,
        });
        Ok(())
    }

    fn poll(&mut self) -> RunnerStatus {
        let mut active = match self.active.take() {
            Some(active) => active,
            None => return RunnerStatus::Idle,
        };

        match active.result_rx.try_recv() {
            Ok((result, store)) => {
                self.store = Some(store);
                log::info!("Transfer task finished: {:?}", result);
                RunnerStatus::Finished(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => {
                let age = self
                    .clock
                    .now_ms()
                    .saturating_sub(active.ctx.last_heartbeat_ms());
                if age > self.timeout_ms {
                    let reason = format!("no heartbeat for {}s", age / 1000);
                    self.kill(active, &reason);
                    RunnerStatus::Hung
                } else {
                    self.active = Some(active);
                    RunnerStatus::Running
                }
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                self.record_watchdog_restart("transfer task ended without a result");
                log::error!("Transfer task ended without a result");
                RunnerStatus::Lost
            }
        }
    }
}

/// Read and clear the marker a watchdog kill left behind.
pub fn take_watchdog_marker(fs: &dyn FileSystem) -> Option<String> {
    let bytes = fs.read(WATCHDOG_MARKER_PATH).ok()?;
    if let Err(e) = remove_if_exists(fs, WATCHDOG_MARKER_PATH) {
        log::warn!("Failed to clear watchdog marker: {}", e);
    }
    Some(String::from_utf8_lossy(&bytes).trim().to_string())
}
