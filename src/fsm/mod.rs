//! Upload orchestration state machine
//!
//! Decides when to borrow the card, runs the transfer through an
//! [`UploadRunner`](crate::supervisor::UploadRunner), hands the card back,
//! and backs off. One `tick()` performs at most one state step and never
//! blocks.

pub mod command;
pub mod machine;

pub use command::{command_channel, Command, CommandReceiver, CommandSender};
pub use machine::{FsmConfig, FsmContext, RestartReason, UploadFsm};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    /// Scheduled mode, outside the window or the day is done.
    Idle,
    /// Waiting for the bus to go quiet.
    Listening,
    Acquiring,
    Uploading,
    Releasing,
    Cooldown,
    Complete,
    /// Passive bus observation, no uploads.
    Monitoring,
}

impl UploadState {
    pub fn name(&self) -> &'static str {
        match self {
            UploadState::Idle => "IDLE",
            UploadState::Listening => "LISTENING",
            UploadState::Acquiring => "ACQUIRING",
            UploadState::Uploading => "UPLOADING",
            UploadState::Releasing => "RELEASING",
            UploadState::Cooldown => "COOLDOWN",
            UploadState::Complete => "COMPLETE",
            UploadState::Monitoring => "MONITORING",
        }
    }

    /// States in which the uploader may hold the card.
    pub fn holds_bus(&self) -> bool {
        matches!(
            self,
            UploadState::Acquiring
                | UploadState::Uploading
                | UploadState::Complete
                | UploadState::Releasing
        )
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
