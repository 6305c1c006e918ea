//! Boot sequence and control loop
//!
//! [`Controller`] owns every long-lived piece: the traffic monitor, the bus
//! switch, the state machine and the transfer supervisor (which in turn owns
//! the state store between transfers). The host calls [`Controller::tick`]
//! every few tens of milliseconds and acts on the restart it may return.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::bus::BusControl;
use crate::clock::{local_time, Clock};
use crate::config::ControllerConfig;
use crate::fsm::{
    command_channel, CommandReceiver, CommandSender, FsmConfig, FsmContext, RestartReason,
    UploadFsm, UploadState,
};
use crate::schedule::UploadSchedule;
use crate::state::{LoadReport, StateError, UploadStateStore};
use crate::storage::FileSystem;
use crate::supervisor::{take_watchdog_marker, TransferSupervisor, TransferWorker};
use crate::traffic::{PulseCounter, TrafficError, TrafficMonitor};

/// Bus silence required after power-up before the first card probe.
pub const BOOT_SILENCE_MS: u64 = 5_000;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("State store error: {0}")]
    State(#[from] StateError),

    #[error("Traffic monitor error: {0}")]
    Traffic(#[from] TrafficError),
}

/// Platform hook for restarting the device.
pub trait SystemControl: Send {
    fn restart(&mut self, reason: RestartReason);
}

/// Records restart requests instead of rebooting.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSystem {
    restarts: Arc<Mutex<Vec<RestartReason>>>,
}

impl SimulatedSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restarts(&self) -> Vec<RestartReason> {
        self.restarts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SystemControl for SimulatedSystem {
    fn restart(&mut self, reason: RestartReason) {
        log::warn!("Simulated restart: {:?}", reason);
        self.restarts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reason);
    }
}

/// Collaborators handed to [`Controller::boot`].
pub struct ControllerParts {
    pub config: ControllerConfig,
    /// Internal flash holding the state files and markers.
    pub system_fs: Arc<dyn FileSystem>,
    pub worker: Arc<dyn TransferWorker>,
    pub bus: Box<dyn BusControl>,
    pub counter: Box<dyn PulseCounter>,
    pub clock: Arc<dyn Clock>,
    pub system: Box<dyn SystemControl>,
}

/// What happened during boot, for the status surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    pub state_reset: bool,
    pub load: LoadReport,
    pub watchdog_restart: Option<String>,
}

pub struct Controller {
    config: ControllerConfig,
    system_fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    traffic: TrafficMonitor,
    bus: Box<dyn BusControl>,
    fsm: UploadFsm,
    supervisor: TransferSupervisor,
    commands: CommandReceiver,
    sender: CommandSender,
    system: Box<dyn SystemControl>,
    boot_probe_pending: bool,
    restart_issued: Option<RestartReason>,
    boot_report: BootReport,
}

impl Controller {
    /// Bring the engine up from persisted state.
    ///
    /// A reset requested before the last restart is applied before the store
    /// is loaded. The first card probe is deferred to [`Controller::tick`]
    /// once the bus has been silent for [`BOOT_SILENCE_MS`].
    pub fn boot(parts: ControllerParts) -> Result<Self, ControllerError> {
        let ControllerParts {
            config,
            system_fs,
            worker,
            bus,
            counter,
            clock,
            system,
        } = parts;
        let config = config.validated();

        let state_reset = UploadStateStore::process_pending_reset(system_fs.as_ref())?;
        let mut store = UploadStateStore::new(Arc::clone(&system_fs), config.store);
        let load = store.load()?;
        log::info!(
            "Upload state: {} completed, {} pending, {} files tracked",
            store.completed_folders_count(),
            store.pending_folders_count(),
            store.tracked_files_count()
        );

        let watchdog_restart = take_watchdog_marker(system_fs.as_ref());
        if let Some(reason) = &watchdog_restart {
            log::warn!("Previous run was restarted by the watchdog: {}", reason);
        }

        let now_ms = clock.now_ms();
        let mut traffic = TrafficMonitor::new(counter);
        traffic.begin(config.cs_sense_pin, now_ms)?;

        let schedule = UploadSchedule::new(
            config.upload_mode,
            config.upload_start_hour,
            config.upload_end_hour,
        );
        let fsm = UploadFsm::new(
            FsmConfig {
                inactivity: config.inactivity(),
                cooldown: config.cooldown(),
            },
            schedule,
            now_ms,
        );
        let supervisor = TransferSupervisor::new(
            worker,
            store,
            Arc::clone(&clock),
            Arc::clone(&system_fs),
        )
        .with_timeout_ms(config.watchdog_timeout().as_millis() as u64);
        let (sender, commands) = command_channel();

        Ok(Self {
            config,
            system_fs,
            clock,
            traffic,
            bus,
            fsm,
            supervisor,
            commands,
            sender,
            system,
            boot_probe_pending: true,
            restart_issued: None,
            boot_report: BootReport {
                state_reset,
                load,
                watchdog_restart,
            },
        })
    }

    /// Handle for queueing commands from other tasks.
    pub fn commands(&self) -> CommandSender {
        self.sender.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn boot_report(&self) -> &BootReport {
        &self.boot_report
    }

    pub fn state(&self) -> UploadState {
        self.fsm.state()
    }

    pub fn time_in_state_ms(&self) -> u64 {
        self.fsm.time_in_state_ms(self.clock.now_ms())
    }

    pub fn traffic(&self) -> &TrafficMonitor {
        &self.traffic
    }

    /// The state store, unless a transfer currently holds it.
    pub fn store(&self) -> Option<&UploadStateStore> {
        self.supervisor.store()
    }

    pub fn boot_probe_pending(&self) -> bool {
        self.boot_probe_pending
    }

    /// Restart already handed to [`SystemControl`], if any.
    pub fn restart_issued(&self) -> Option<RestartReason> {
        self.restart_issued
    }

    /// Check the card can be mounted, then hand it straight back.
    fn probe_card(&mut self) {
        self.boot_probe_pending = false;
        match self.bus.take_control() {
            Ok(()) => log::info!("Boot probe: card mounted"),
            Err(e) => log::warn!("Boot probe: {}", e),
        }
        self.bus.release_control();
        self.traffic.reset_idle_tracking();
    }

    /// One pass of the control loop. Returns the restart requested on this
    /// pass, after it has been passed to [`SystemControl`].
    pub fn tick(&mut self) -> Option<RestartReason> {
        if self.restart_issued.is_some() {
            return None;
        }
        let now_ms = self.clock.now_ms();
        self.traffic.update(now_ms);

        for command in self.commands.drain() {
            self.fsm.handle_command(command);
        }

        if self.boot_probe_pending
            && !self.fsm.state().holds_bus()
            && self.traffic.is_idle_for(BOOT_SILENCE_MS)
        {
            self.probe_card();
        }

        let local = local_time(self.clock.unix_time(), self.config.gmt_offset_seconds());
        let mut ctx = FsmContext {
            now_ms,
            local_time: local,
            traffic: &mut self.traffic,
            bus: self.bus.as_mut(),
            runner: &mut self.supervisor,
        };
        self.fsm.tick(&mut ctx);

        let reason = self.fsm.take_restart_request()?;
        self.restart(reason);
        Some(reason)
    }

    fn restart(&mut self, reason: RestartReason) {
        self.bus.release_control();
        if reason == RestartReason::StateReset {
            if let Err(e) = UploadStateStore::request_reset(self.system_fs.as_ref()) {
                log::error!("Failed to write reset marker: {}", e);
            }
        } else if let Some(store) = self.supervisor.store_mut() {
            if let Err(e) = store.save() {
                log::error!("Failed to save upload state before restart: {}", e);
            }
        }
        log::warn!("Restarting: {:?}", reason);
        self.restart_issued = Some(reason);
        self.system.restart(reason);
    }
}
