use std::time::Duration;

use chrono::NaiveDateTime;

use super::{Command, UploadState};
use crate::bus::BusControl;
use crate::schedule::UploadSchedule;
use crate::supervisor::{RunnerStatus, TransferResult, UploadRunner};
use crate::traffic::TrafficMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmConfig {
    pub inactivity: Duration,
    pub cooldown: Duration,
}

/// Why the state machine wants the device restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// A session uploaded data; restart for a clean heap and link.
    UploadFinished,
    /// The transfer task hung or died.
    WorkerHung,
    /// The user asked for the upload state to be wiped.
    StateReset,
}

/// Everything one step may touch.
pub struct FsmContext<'a> {
    pub now_ms: u64,
    pub local_time: NaiveDateTime,
    pub traffic: &'a mut TrafficMonitor,
    pub bus: &'a mut dyn BusControl,
    pub runner: &'a mut dyn UploadRunner,
}

/// How the bus-holding part of a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Transfer(TransferResult),
    NotAcquired,
    Aborted,
}

pub struct UploadFsm {
    state: UploadState,
    entered_ms: u64,
    config: FsmConfig,
    schedule: UploadSchedule,
    outcome: Option<CycleOutcome>,
    upload_now: bool,
    monitor_requested: bool,
    stop_monitoring: bool,
    reset_requested: bool,
    restart: Option<RestartReason>,
}

impl UploadFsm {
    pub fn new(config: FsmConfig, schedule: UploadSchedule, now_ms: u64) -> Self {
        let state = if schedule.is_scheduled() {
            UploadState::Idle
        } else {
            UploadState::Listening
        };
        log::info!("Upload state machine starting in {}", state);
        Self {
            state,
            entered_ms: now_ms,
            config,
            schedule,
            outcome: None,
            upload_now: false,
            monitor_requested: false,
            stop_monitoring: false,
            reset_requested: false,
            restart: None,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn time_in_state_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.entered_ms)
    }

    pub fn schedule(&self) -> &UploadSchedule {
        &self.schedule
    }

    pub fn restart_requested(&self) -> Option<RestartReason> {
        self.restart
    }

    pub fn take_restart_request(&mut self) -> Option<RestartReason> {
        self.restart.take()
    }

    fn transition(&mut self, to: UploadState, now_ms: u64) {
        if to != self.state {
            log::info!("[FSM] {} -> {}", self.state, to);
            self.state = to;
            self.entered_ms = now_ms;
        }
    }

    fn request_restart(&mut self, reason: RestartReason) {
        log::warn!("[FSM] Restart requested: {:?}", reason);
        self.restart = Some(reason);
    }

    /// Record a command. Anything that would disturb a cycle in progress is
    /// held until the card has been handed back.
    pub fn handle_command(&mut self, command: Command) {
        log::info!("[FSM] Command {:?} in {}", command, self.state);
        match command {
            Command::UploadNow => self.upload_now = true,
            Command::StartMonitoring => {
                self.monitor_requested = true;
                self.stop_monitoring = false;
            }
            Command::StopMonitoring => {
                if self.state == UploadState::Monitoring {
                    self.stop_monitoring = true;
                }
                self.monitor_requested = false;
            }
            Command::ResetState => self.reset_requested = true,
        }
    }

    /// Target after a wait: listen if an upload may start, else idle.
    fn resume_state(&self, local: &NaiveDateTime) -> UploadState {
        if self.upload_now || self.schedule.is_upload_allowed(local) {
            UploadState::Listening
        } else {
            UploadState::Idle
        }
    }

    fn enter_monitoring(&mut self, ctx: &mut FsmContext<'_>) {
        self.monitor_requested = false;
        self.stop_monitoring = false;
        ctx.traffic.reset_statistics(ctx.now_ms);
        self.transition(UploadState::Monitoring, ctx.now_ms);
    }

    /// Run one step.
    pub fn tick(&mut self, ctx: &mut FsmContext<'_>) {
        if !self.state.holds_bus() {
            if self.reset_requested {
                self.reset_requested = false;
                self.request_restart(RestartReason::StateReset);
                return;
            }
            if self.monitor_requested && self.state != UploadState::Monitoring {
                self.enter_monitoring(ctx);
                return;
            }
        }

        match self.state {
            UploadState::Idle => self.handle_idle(ctx),
            UploadState::Listening => self.handle_listening(ctx),
            UploadState::Acquiring => self.handle_acquiring(ctx),
            UploadState::Uploading => self.handle_uploading(ctx),
            UploadState::Releasing => self.handle_releasing(ctx),
            UploadState::Cooldown => self.handle_cooldown(ctx),
            UploadState::Complete => self.handle_complete(ctx),
            UploadState::Monitoring => self.handle_monitoring(ctx),
        }
    }

    fn handle_idle(&mut self, ctx: &mut FsmContext<'_>) {
        if self.resume_state(&ctx.local_time) == UploadState::Listening {
            self.transition(UploadState::Listening, ctx.now_ms);
        }
    }

    fn handle_listening(&mut self, ctx: &mut FsmContext<'_>) {
        if self.resume_state(&ctx.local_time) == UploadState::Idle {
            self.transition(UploadState::Idle, ctx.now_ms);
            return;
        }
        let needed = self.config.inactivity.as_millis() as u64;
        if ctx.traffic.is_idle_for(needed) {
            log::info!(
                "[FSM] Bus idle for {} ms, acquiring card",
                ctx.traffic.consecutive_idle_ms()
            );
            self.transition(UploadState::Acquiring, ctx.now_ms);
        }
    }

    fn handle_acquiring(&mut self, ctx: &mut FsmContext<'_>) {
        self.upload_now = false;

        if let Err(e) = ctx.bus.take_control() {
            log::warn!("[FSM] Could not take the card: {}", e);
            self.outcome = Some(CycleOutcome::NotAcquired);
            self.transition(UploadState::Releasing, ctx.now_ms);
            return;
        }

        match ctx.runner.start() {
            Ok(()) => self.transition(UploadState::Uploading, ctx.now_ms),
            Err(e) => {
                log::error!("[FSM] Could not start transfer: {}", e);
                self.outcome = Some(CycleOutcome::NotAcquired);
                self.transition(UploadState::Releasing, ctx.now_ms);
            }
        }
    }

    fn handle_uploading(&mut self, ctx: &mut FsmContext<'_>) {
        match ctx.runner.poll() {
            RunnerStatus::Running => {}
            RunnerStatus::Finished(TransferResult::Complete) => {
                self.transition(UploadState::Complete, ctx.now_ms);
            }
            RunnerStatus::Finished(result) => {
                log::info!("[FSM] Transfer ended: {:?}", result);
                self.outcome = Some(CycleOutcome::Transfer(result));
                self.transition(UploadState::Releasing, ctx.now_ms);
            }
            status @ (RunnerStatus::Hung | RunnerStatus::Lost | RunnerStatus::Idle) => {
                log::error!("[FSM] Transfer task {:?}, releasing card", status);
                ctx.bus.release_control();
                self.request_restart(RestartReason::WorkerHung);
                self.outcome = Some(CycleOutcome::Aborted);
                self.transition(UploadState::Releasing, ctx.now_ms);
            }
        }
    }

    fn handle_complete(&mut self, ctx: &mut FsmContext<'_>) {
        if self.schedule.is_scheduled() {
            ctx.bus.release_control();
            ctx.traffic.reset_idle_tracking();
            self.schedule.mark_day_completed(&ctx.local_time);
            self.transition(UploadState::Idle, ctx.now_ms);
        } else {
            self.outcome = Some(CycleOutcome::Transfer(TransferResult::Complete));
            self.transition(UploadState::Releasing, ctx.now_ms);
        }
    }

    fn handle_releasing(&mut self, ctx: &mut FsmContext<'_>) {
        ctx.bus.release_control();
        ctx.traffic.reset_idle_tracking();
        let outcome = self.outcome.take();

        if self.reset_requested {
            self.reset_requested = false;
            self.request_restart(RestartReason::StateReset);
            self.transition(UploadState::Cooldown, ctx.now_ms);
            return;
        }
        if self.monitor_requested {
            self.enter_monitoring(ctx);
            return;
        }

        match outcome {
            Some(CycleOutcome::Transfer(TransferResult::Complete))
            | Some(CycleOutcome::Transfer(TransferResult::Timeout)) => {
                self.request_restart(RestartReason::UploadFinished);
            }
            Some(CycleOutcome::Transfer(TransferResult::NothingToDo)) => {
                log::info!("[FSM] Nothing to upload, cooling down");
            }
            Some(CycleOutcome::Transfer(TransferResult::Error))
            | Some(CycleOutcome::NotAcquired) => {
                log::warn!("[FSM] Cycle failed, cooling down before retry");
            }
            Some(CycleOutcome::Aborted) | None => {}
        }
        self.transition(UploadState::Cooldown, ctx.now_ms);
    }

    fn handle_cooldown(&mut self, ctx: &mut FsmContext<'_>) {
        let cooldown = self.config.cooldown.as_millis() as u64;
        if self.upload_now || self.time_in_state_ms(ctx.now_ms) >= cooldown {
            let next = self.resume_state(&ctx.local_time);
            self.transition(next, ctx.now_ms);
        }
    }

    fn handle_monitoring(&mut self, ctx: &mut FsmContext<'_>) {
        if self.stop_monitoring {
            self.stop_monitoring = false;
            let next = self.resume_state(&ctx.local_time);
            self.transition(next, ctx.now_ms);
        }
    }
}
