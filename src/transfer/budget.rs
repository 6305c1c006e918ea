use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_RATE_BYTES_PER_SEC: u64 = 40 * 1024;
pub const RATE_HISTORY_SIZE: usize = 5;

/// Time budget for one exclusive-access session.
///
/// Upload time is estimated from the average of the last few measured
/// transfer rates so a file is not started if it cannot finish in time.
#[derive(Debug, Clone)]
pub struct TimeBudget {
    start_ms: u64,
    duration_ms: u64,
    rate: u64,
    history: VecDeque<u64>,
}

impl Default for TimeBudget {
    fn default() -> Self {
        Self {
            start_ms: 0,
            duration_ms: 0,
            rate: DEFAULT_RATE_BYTES_PER_SEC,
            history: VecDeque::with_capacity(RATE_HISTORY_SIZE),
        }
    }
}

impl TimeBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_session(&mut self, now_ms: u64, duration: Duration) {
        self.start_ms = now_ms;
        self.duration_ms = duration.as_millis() as u64;
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.start_ms);
        self.duration_ms.saturating_sub(elapsed)
    }

    pub fn has_budget(&self, now_ms: u64) -> bool {
        self.remaining_ms(now_ms) > 0
    }

    pub fn estimate_ms(&self, size: u64) -> u64 {
        let rate = self.rate.max(1);
        (size / rate) * 1000 + (size % rate) * 1000 / rate
    }

    pub fn can_upload(&self, size: u64, now_ms: u64) -> bool {
        let estimate = self.estimate_ms(size);
        let remaining = self.remaining_ms(now_ms);
        log::debug!(
            "[Budget] {} bytes, estimated {} ms, remaining {} ms, rate {} B/s",
            size,
            estimate,
            remaining,
            self.rate
        );
        estimate <= remaining
    }

    /// Fold a measured transfer into the rate estimate.
    pub fn record_upload(&mut self, bytes: u64, elapsed_ms: u64) {
        if elapsed_ms == 0 {
            return;
        }
        if self.history.len() == RATE_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(bytes * 1000 / elapsed_ms);
        self.rate = self.history.iter().sum::<u64>() / self.history.len() as u64;
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }
}
