use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use super::LinkControl;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    /// Minimum spacing between two cycles.
    pub cooldown: Duration,
    /// How long to wait for a cycle already in progress.
    pub concurrent_wait: Duration,
    /// Pause between disconnect and reconnect.
    pub disconnect_delay: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(45),
            concurrent_wait: Duration::from_secs(15),
            disconnect_delay: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

/// Marks a stateful transfer session (one holding a live connection that a
/// link cycle would invalidate). The guard skips cycles while any exist.
pub struct SessionGuard {
    sessions: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct NetworkGuard {
    link: Arc<dyn LinkControl>,
    config: GuardConfig,
    cycling: AtomicBool,
    sessions: Arc<AtomicUsize>,
    last_cycle: Mutex<Option<Instant>>,
}

impl NetworkGuard {
    pub fn new(link: Arc<dyn LinkControl>, config: GuardConfig) -> Self {
        Self {
            link,
            config,
            cycling: AtomicBool::new(false),
            sessions: Arc::new(AtomicUsize::new(0)),
            last_cycle: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn begin_session(&self) -> SessionGuard {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            sessions: Arc::clone(&self.sessions),
        }
    }

    pub fn session_active(&self) -> bool {
        self.sessions.load(Ordering::SeqCst) > 0
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        let last = *self.last_cycle.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = last?.elapsed();
        self.config.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    async fn wait_while<F: Fn() -> bool>(
        &self,
        limit: Duration,
        cond: F,
        heartbeat: &(dyn Fn() + Sync),
    ) {
        let start = Instant::now();
        while cond() && start.elapsed() < limit {
            heartbeat();
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Cycle the link to clear wedged socket state, if allowed.
    ///
    /// `heartbeat` is called throughout so a watchdog does not mistake the
    /// wait for a hang. Returns whether the link is up afterwards.
    pub async fn try_cycle(&self, heartbeat: &(dyn Fn() + Sync)) -> bool {
        if self.session_active() {
            log::warn!("Link cycle skipped, stateful session active");
            return self.link.is_connected();
        }

        if self.cycling.load(Ordering::SeqCst) {
            log::warn!(
                "Link cycle already in progress, waiting up to {}s",
                self.config.concurrent_wait.as_secs()
            );
            self.wait_while(
                self.config.concurrent_wait,
                || self.cycling.load(Ordering::SeqCst),
                heartbeat,
            )
            .await;
            if self.cycling.load(Ordering::SeqCst) {
                log::warn!("Timed out waiting for in-progress link cycle, skipping");
            }
            return self.link.is_connected();
        }

        if let Some(remaining) = self.cooldown_remaining() {
            log::warn!("Link cycle skipped, cooldown active ({}s remaining)", remaining.as_secs());
            return self.link.is_connected();
        }

        if self
            .cycling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return self.link.is_connected();
        }

        log::warn!("Cycling network link to clear socket state");
        self.link.disconnect().await;
        heartbeat();
        tokio::time::sleep(self.config.disconnect_delay).await;

        self.link.reconnect().await;
        self.wait_while(
            self.config.reconnect_timeout,
            || !self.link.is_connected(),
            heartbeat,
        )
        .await;

        *self.last_cycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.cycling.store(false, Ordering::SeqCst);

        if self.link.is_connected() {
            log::info!("Link cycle complete, reconnected");
            true
        } else {
            log::error!("Link cycle complete but reconnect failed");
            false
        }
    }
}
