//! Network link recovery
//!
//! Long uploads occasionally leave the TCP stack wedged; the cure is to drop
//! and re-join the wireless link. [`NetworkGuard`] serializes those cycles,
//! rate-limits them, and refuses to cycle under a live stateful session.

pub mod recovery;

pub use recovery::{GuardConfig, NetworkGuard, SessionGuard};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// The wireless link as seen by the recovery guard.
#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Drop the association, keeping stored credentials.
    async fn disconnect(&self);

    /// Start re-joining. Completion is observed through `is_connected`.
    async fn reconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Link stand-in for tests and the host simulator.
#[derive(Clone)]
pub struct SimulatedLink {
    connected: Arc<AtomicBool>,
    reconnect_works: Arc<AtomicBool>,
    reconnect_delay: Duration,
    cycles: Arc<AtomicU32>,
}

impl SimulatedLink {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(true)),
            reconnect_works: Arc::new(AtomicBool::new(true)),
            reconnect_delay,
            cycles: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_reconnect_works(&self, works: bool) {
        self.reconnect_works.store(works, Ordering::SeqCst);
    }

    /// Number of disconnects performed.
    pub fn cycles(&self) -> u32 {
        self.cycles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkControl for SimulatedLink {
    async fn disconnect(&self) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn reconnect(&self) {
        if !self.reconnect_works.load(Ordering::SeqCst) {
            return;
        }
        let connected = Arc::clone(&self.connected);
        let delay = self.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            connected.store(true, Ordering::SeqCst);
        });
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
