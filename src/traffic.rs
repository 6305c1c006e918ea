//! Bus activity monitor
//!
//! Counts edges on the card's chip-select sense line. Any pulse in a 100 ms
//! sample marks the bus busy and resets the consecutive-idle counter. Pulse
//! counts are also folded into one-second samples kept in a 20 minute ring
//! buffer for status reporting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

pub const SAMPLE_INTERVAL_MS: u64 = 100;
pub const MAX_SAMPLES: usize = 1200;
/// Pulses shorter than this are glitches, not bus traffic.
pub const GLITCH_FILTER_NS: u32 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrafficError {
    #[error("Pulse counter configuration failed: {0}")]
    ConfigError(String),
}

/// Hardware edge counter on the sense line.
pub trait PulseCounter: Send {
    fn configure(&mut self, pin: u8, glitch_filter_ns: u32) -> Result<(), TrafficError>;

    /// Edges counted since the previous call.
    fn read_and_clear(&mut self) -> u32;
}

/// Counter fed by the host simulator or a test.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPulseCounter {
    pending: Arc<AtomicU32>,
}

impl SimulatedPulseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` edges as if the host device touched the card.
    pub fn add_pulses(&self, count: u32) {
        self.pending.fetch_add(count, Ordering::SeqCst);
    }
}

impl PulseCounter for SimulatedPulseCounter {
    fn configure(&mut self, pin: u8, glitch_filter_ns: u32) -> Result<(), TrafficError> {
        log::debug!("Simulated pulse counter on pin {} (filter {} ns)", pin, glitch_filter_ns);
        self.pending.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn read_and_clear(&mut self) -> u32 {
        self.pending.swap(0, Ordering::SeqCst)
    }
}

/// One second of bus activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivitySample {
    pub timestamp: u32,
    pub pulse_count: u16,
    pub active: bool,
}

pub struct TrafficMonitor {
    counter: Box<dyn PulseCounter>,
    initialized: bool,
    last_sample_ms: u64,
    last_sample_active: bool,
    last_pulse_count: u32,
    consecutive_idle_ms: u64,
    last_second_ms: u64,
    second_accumulator: u32,
    samples: Vec<ActivitySample>,
    head: usize,
    longest_idle_ms: u64,
    total_active_samples: u32,
    total_idle_samples: u32,
}

impl TrafficMonitor {
    pub fn new(counter: Box<dyn PulseCounter>) -> Self {
        Self {
            counter,
            initialized: false,
            last_sample_ms: 0,
            last_sample_active: false,
            last_pulse_count: 0,
            consecutive_idle_ms: 0,
            last_second_ms: 0,
            second_accumulator: 0,
            samples: Vec::with_capacity(MAX_SAMPLES),
            head: 0,
            longest_idle_ms: 0,
            total_active_samples: 0,
            total_idle_samples: 0,
        }
    }

    pub fn begin(&mut self, pin: u8, now_ms: u64) -> Result<(), TrafficError> {
        self.counter.configure(pin, GLITCH_FILTER_NS)?;
        self.last_sample_ms = now_ms;
        self.last_second_ms = now_ms;
        self.initialized = true;
        log::info!("Traffic monitor started on pin {}", pin);
        Ok(())
    }

    /// Take a sample if one is due. Call from the control loop.
    pub fn update(&mut self, now_ms: u64) {
        if !self.initialized {
            return;
        }
        let elapsed = now_ms.saturating_sub(self.last_sample_ms);
        if elapsed < SAMPLE_INTERVAL_MS {
            return;
        }
        self.last_sample_ms = now_ms;

        self.last_pulse_count = self.counter.read_and_clear();
        self.last_sample_active = self.last_pulse_count > 0;

        if self.last_sample_active {
            self.consecutive_idle_ms = 0;
        } else {
            self.consecutive_idle_ms += elapsed;
            self.longest_idle_ms = self.longest_idle_ms.max(self.consecutive_idle_ms);
        }

        self.second_accumulator = self.second_accumulator.saturating_add(self.last_pulse_count);
        if now_ms.saturating_sub(self.last_second_ms) >= 1000 {
            let pulses = self.second_accumulator.min(u16::MAX as u32) as u16;
            self.push_sample((now_ms / 1000) as u32, pulses);
            if pulses > 0 {
                self.total_active_samples += 1;
            } else {
                self.total_idle_samples += 1;
            }
            self.second_accumulator = 0;
            self.last_second_ms = now_ms;
        }
    }

    fn push_sample(&mut self, timestamp: u32, pulse_count: u16) {
        let sample = ActivitySample {
            timestamp,
            pulse_count,
            active: pulse_count > 0,
        };
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(sample);
        } else {
            self.samples[self.head] = sample;
        }
        self.head = (self.head + 1) % MAX_SAMPLES;
    }

    pub fn is_busy(&self) -> bool {
        self.last_sample_active
    }

    pub fn is_idle_for(&self, ms: u64) -> bool {
        self.consecutive_idle_ms >= ms
    }

    pub fn consecutive_idle_ms(&self) -> u64 {
        self.consecutive_idle_ms
    }

    pub fn reset_idle_tracking(&mut self) {
        self.consecutive_idle_ms = 0;
    }

    pub fn last_pulse_count(&self) -> u32 {
        self.last_pulse_count
    }

    pub fn longest_idle_ms(&self) -> u64 {
        self.longest_idle_ms
    }

    pub fn total_active_samples(&self) -> u32 {
        self.total_active_samples
    }

    pub fn total_idle_samples(&self) -> u32 {
        self.total_idle_samples
    }

    /// One-second samples, oldest first.
    pub fn samples(&self) -> Vec<ActivitySample> {
        if self.samples.len() < MAX_SAMPLES {
            return self.samples.clone();
        }
        let mut ordered = Vec::with_capacity(MAX_SAMPLES);
        ordered.extend_from_slice(&self.samples[self.head..]);
        ordered.extend_from_slice(&self.samples[..self.head]);
        ordered
    }

    pub fn reset_statistics(&mut self, now_ms: u64) {
        self.longest_idle_ms = 0;
        self.total_active_samples = 0;
        self.total_idle_samples = 0;
        self.samples.clear();
        self.head = 0;
        self.second_accumulator = 0;
        self.last_second_ms = now_ms;
        log::info!("Traffic statistics reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (SimulatedPulseCounter, TrafficMonitor) {
        let counter = SimulatedPulseCounter::new();
        let mut monitor = TrafficMonitor::new(Box::new(counter.clone()));
        monitor.begin(33, 0).unwrap();
        (counter, monitor)
    }

    #[test]
    fn test_idle_accumulates_between_pulses() {
        let (counter, mut monitor) = monitor();
        for t in (100..=5000).step_by(100) {
            monitor.update(t);
        }
        assert!(monitor.is_idle_for(5000));
        assert!(!monitor.is_busy());

        counter.add_pulses(3);
        monitor.update(5100);
        assert!(monitor.is_busy());
        assert_eq!(monitor.consecutive_idle_ms(), 0);
        assert_eq!(monitor.longest_idle_ms(), 5000);
    }

    #[test]
    fn test_updates_faster_than_interval_are_ignored() {
        let (counter, mut monitor) = monitor();
        counter.add_pulses(1);
        monitor.update(50);
        assert!(!monitor.is_busy());
        monitor.update(100);
        assert!(monitor.is_busy());
    }

    #[test]
    fn test_uninitialized_monitor_does_nothing() {
        let counter = SimulatedPulseCounter::new();
        let mut monitor = TrafficMonitor::new(Box::new(counter));
        monitor.update(10_000);
        assert_eq!(monitor.consecutive_idle_ms(), 0);
    }

    #[test]
    fn test_second_samples_and_ring_buffer() {
        let (counter, mut monitor) = monitor();
        let mut t = 0;
        for second in 0..(MAX_SAMPLES as u64 + 10) {
            if second % 2 == 0 {
                counter.add_pulses(2);
            }
            for _ in 0..10 {
                t += 100;
                monitor.update(t);
            }
        }
        let samples = monitor.samples();
        assert_eq!(samples.len(), MAX_SAMPLES);
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(
            monitor.total_active_samples() + monitor.total_idle_samples(),
            MAX_SAMPLES as u32 + 10
        );

        monitor.reset_statistics(t);
        assert!(monitor.samples().is_empty());
        assert_eq!(monitor.longest_idle_ms(), 0);
    }

    #[test]
    fn test_reset_idle_tracking() {
        let (_counter, mut monitor) = monitor();
        monitor.update(1000);
        assert!(monitor.is_idle_for(1000));
        monitor.reset_idle_tracking();
        assert!(!monitor.is_idle_for(1));
    }
}
