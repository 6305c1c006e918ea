// sdbridge - SD card bus-sharing upload engine

pub mod bus;
pub mod clock;
pub mod config;
pub mod controller;
pub mod fsm;
pub mod network;
pub mod schedule;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod traffic;
pub mod transfer;

pub use controller::{Controller, ControllerError, ControllerParts, SystemControl};
pub use fsm::{Command, CommandSender, RestartReason, UploadState};
pub use state::UploadStateStore;
pub use supervisor::TransferResult;
