//! Time sources
//!
//! The control loop works in milliseconds since boot; the transfer worker
//! also needs wall-clock seconds to age pending folders. Both go through
//! [`Clock`] so tests can drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};

/// Wall clock values below this are treated as "not synced yet".
pub const MIN_VALID_UNIX_TIME: u64 = 1_000_000_000;

pub trait Clock: Send + Sync {
    /// Milliseconds since boot. Monotonic.
    fn now_ms(&self) -> u64;

    /// Seconds since the Unix epoch.
    fn unix_time(&self) -> u64;

    fn is_time_valid(&self) -> bool {
        self.unix_time() >= MIN_VALID_UNIX_TIME
    }
}

/// Local wall-clock time at a fixed UTC offset.
pub fn local_time(unix_seconds: u64, gmt_offset_seconds: i32) -> NaiveDateTime {
    let offset = FixedOffset::east_opt(gmt_offset_seconds).unwrap_or_else(|| Utc.fix());
    Utc.timestamp_opt(unix_seconds as i64, 0)
        .single()
        .map(|utc: DateTime<Utc>| utc.with_timezone(&offset).naive_local())
        .unwrap_or_default()
}

/// Real clock: tokio's monotonic instant plus the system wall clock.
pub struct SystemClock {
    start: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn unix_time(&self) -> u64 {
        Utc::now().timestamp().max(0) as u64
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
    unix_time: AtomicU64,
}

impl ManualClock {
    pub fn new(unix_time: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(0),
            unix_time: AtomicU64::new(unix_time),
        }
    }

    /// Move both clocks forward.
    pub fn advance_ms(&self, ms: u64) {
        let before = self.now_ms.fetch_add(ms, Ordering::SeqCst);
        let after = before + ms;
        let whole_seconds = after / 1000 - before / 1000;
        self.unix_time.fetch_add(whole_seconds, Ordering::SeqCst);
    }

    pub fn set_unix_time(&self, unix_time: u64) {
        self.unix_time.store(unix_time, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn unix_time(&self) -> u64 {
        self.unix_time.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_manual_clock_advances_both() {
        let clock = ManualClock::new(1_700_000_000);
        clock.advance_ms(2500);
        assert_eq!(clock.now_ms(), 2500);
        assert_eq!(clock.unix_time(), 1_700_000_002);
        clock.advance_ms(500);
        assert_eq!(clock.unix_time(), 1_700_000_003);
    }

    #[test]
    fn test_unsynced_clock_is_invalid() {
        assert!(!ManualClock::new(3600).is_time_valid());
        assert!(ManualClock::new(1_700_000_000).is_time_valid());
    }

    #[test]
    fn test_local_time_applies_offset() {
        // 2023-11-14 22:13:20 UTC
        let t = local_time(1_700_000_000, 0);
        assert_eq!(t.hour(), 22);
        let t = local_time(1_700_000_000, 3 * 3600);
        assert_eq!(t.hour(), 1);
    }
}
