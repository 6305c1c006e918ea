//! Controller configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) yields a working setup. Out-of-range values are clamped
//! rather than rejected, with a warning.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schedule::ScheduleMode;
use crate::state::StoreLimits;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    ReadError { path: String, reason: String },

    #[error("Invalid config: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub upload_mode: ScheduleMode,
    /// First hour (local time) of the scheduled upload window.
    pub upload_start_hour: u32,
    /// Hour the window closes. Equal to the start hour means all day.
    pub upload_end_hour: u32,
    /// Bus silence required before taking the card.
    pub inactivity_seconds: u64,
    /// Upper bound on one upload session while holding the card.
    pub exclusive_access_minutes: u64,
    pub cooldown_minutes: u64,
    /// Attempts per day folder before it is skipped for the session.
    pub max_retry_attempts: u32,
    pub gmt_offset_hours: i32,
    /// Completed folders this many days old or newer are re-checked.
    pub recent_folder_days: u32,
    /// Ignore day folders older than this. Zero disables the filter.
    pub max_days: u32,
    /// Heartbeat age after which the transfer task is considered hung.
    pub watchdog_timeout_seconds: u64,
    pub cs_sense_pin: u8,
    pub store: StoreLimits,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            upload_mode: ScheduleMode::Continuous,
            upload_start_hour: 9,
            upload_end_hour: 21,
            inactivity_seconds: 125,
            exclusive_access_minutes: 5,
            cooldown_minutes: 10,
            max_retry_attempts: 3,
            gmt_offset_hours: 0,
            recent_folder_days: 2,
            max_days: 365,
            watchdog_timeout_seconds: 120,
            cs_sense_pin: 33,
            store: StoreLimits::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(config.validated())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Clamp every field into its supported range.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();

        if self.upload_start_hour > 23 {
            log::warn!(
                "upload_start_hour {} out of range, using {}",
                self.upload_start_hour,
                defaults.upload_start_hour
            );
            self.upload_start_hour = defaults.upload_start_hour;
        }
        if self.upload_end_hour > 23 {
            log::warn!(
                "upload_end_hour {} out of range, using {}",
                self.upload_end_hour,
                defaults.upload_end_hour
            );
            self.upload_end_hour = defaults.upload_end_hour;
        }
        self.inactivity_seconds = clamp("inactivity_seconds", self.inactivity_seconds, 10, 3600);
        self.exclusive_access_minutes =
            clamp("exclusive_access_minutes", self.exclusive_access_minutes, 1, 30);
        self.cooldown_minutes = clamp("cooldown_minutes", self.cooldown_minutes, 1, 60);
        self.max_days = self.max_days.min(366);
        if self.max_retry_attempts == 0 {
            self.max_retry_attempts = 1;
        }
        if !(-12..=14).contains(&self.gmt_offset_hours) {
            log::warn!("gmt_offset_hours {} out of range, using UTC", self.gmt_offset_hours);
            self.gmt_offset_hours = 0;
        }
        self
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_seconds)
    }

    pub fn exclusive_access(&self) -> Duration {
        Duration::from_secs(self.exclusive_access_minutes * 60)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_seconds)
    }

    pub fn gmt_offset_seconds(&self) -> i32 {
        self.gmt_offset_hours * 3600
    }
}

fn clamp(name: &str, value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        log::warn!("{} {} out of range, clamped to {}", name, value, clamped);
    }
    clamped
}
