//! Card bus ownership
//!
//! The host device owns the card by default. The uploader borrows it by
//! flipping the bus multiplexer and mounting the card, and must hand it
//! back before the host notices. Activity checks happen before
//! `take_control` is ever called; this layer only switches and mounts.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Card mount failed: {0}")]
    MountFailed(String),

    #[error("No card present")]
    NoCard,
}

pub trait BusControl: Send {
    /// Switch the bus to the uploader and mount the card. Idempotent.
    fn take_control(&mut self) -> Result<(), BusError>;

    /// Unmount and hand the bus back to the host. Idempotent.
    fn release_control(&mut self);

    fn has_control(&self) -> bool;
}

#[derive(Debug, Default)]
struct BusState {
    uploader_owns: bool,
    card_missing: bool,
    fail_mounts: u32,
    takes: u32,
    releases: u32,
}

/// In-process bus switch.
///
/// Clones share state, so a test can keep one handle to inspect ownership
/// while the controller owns another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_card_present(&self, present: bool) {
        self.lock().card_missing = !present;
    }

    /// Make the next `count` mounts fail.
    pub fn fail_next_mounts(&self, count: u32) {
        self.lock().fail_mounts = count;
    }

    pub fn take_count(&self) -> u32 {
        self.lock().takes
    }

    pub fn release_count(&self) -> u32 {
        self.lock().releases
    }
}

impl BusControl for SimulatedBus {
    fn take_control(&mut self) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.uploader_owns {
            return Ok(());
        }
        state.takes += 1;
        if state.card_missing {
            log::warn!("No card attached");
            return Err(BusError::NoCard);
        }
        if state.fail_mounts > 0 {
            state.fail_mounts -= 1;
            log::warn!("Card mount failed, bus left with host");
            return Err(BusError::MountFailed("simulated mount failure".to_string()));
        }
        state.uploader_owns = true;
        log::info!("Card mounted, bus owned by uploader");
        Ok(())
    }

    fn release_control(&mut self) {
        let mut state = self.lock();
        if !state.uploader_owns {
            return;
        }
        state.uploader_owns = false;
        state.releases += 1;
        log::info!("Card control released to host");
    }

    fn has_control(&self) -> bool {
        self.lock().uploader_owns
    }
}
