//! Upload window
//!
//! In continuous mode uploads may start whenever the bus is quiet. In
//! scheduled mode they are confined to an hour window (which may wrap past
//! midnight) and stop for the day once a session finishes with nothing left.

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[serde(alias = "smart")]
    Continuous,
    Scheduled,
}

#[derive(Debug, Clone)]
pub struct UploadSchedule {
    mode: ScheduleMode,
    start_hour: u32,
    end_hour: u32,
    completed_day: Option<NaiveDate>,
}

impl UploadSchedule {
    pub fn new(mode: ScheduleMode, start_hour: u32, end_hour: u32) -> Self {
        Self {
            mode,
            start_hour: start_hour % 24,
            end_hour: end_hour % 24,
            completed_day: None,
        }
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    pub fn is_scheduled(&self) -> bool {
        self.mode == ScheduleMode::Scheduled
    }

    /// Whether `local` falls inside the hour window.
    pub fn is_in_window(&self, local: &NaiveDateTime) -> bool {
        let hour = local.hour();
        if self.start_hour == self.end_hour {
            true
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// The calendar day a window belongs to. A window that wraps midnight
    /// belongs to the day it opened on.
    pub fn window_day(&self, local: &NaiveDateTime) -> NaiveDate {
        let date = local.date();
        if self.start_hour > self.end_hour && local.hour() < self.end_hour {
            date.pred_opt().unwrap_or(date)
        } else {
            date
        }
    }

    pub fn mark_day_completed(&mut self, local: &NaiveDateTime) {
        let day = self.window_day(local);
        log::info!("Scheduled upload complete for {}", day);
        self.completed_day = Some(day);
    }

    pub fn is_day_completed(&self, local: &NaiveDateTime) -> bool {
        self.completed_day == Some(self.window_day(local))
    }

    /// Whether a new session may begin now.
    pub fn is_upload_allowed(&self, local: &NaiveDateTime) -> bool {
        match self.mode {
            ScheduleMode::Continuous => true,
            ScheduleMode::Scheduled => self.is_in_window(local) && !self.is_day_completed(local),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, day)
            .unwrap()
            .and_hms_opt(hour, 30, 0)
            .unwrap()
    }

    #[test]
    fn test_daytime_window() {
        let schedule = UploadSchedule::new(ScheduleMode::Scheduled, 9, 21);
        assert!(!schedule.is_in_window(&at(1, 8)));
        assert!(schedule.is_in_window(&at(1, 9)));
        assert!(schedule.is_in_window(&at(1, 20)));
        assert!(!schedule.is_in_window(&at(1, 21)));
    }

    #[test]
    fn test_window_wraps_midnight() {
        let schedule = UploadSchedule::new(ScheduleMode::Scheduled, 22, 6);
        assert!(schedule.is_in_window(&at(1, 23)));
        assert!(schedule.is_in_window(&at(2, 0)));
        assert!(schedule.is_in_window(&at(2, 5)));
        assert!(!schedule.is_in_window(&at(2, 6)));
        assert!(!schedule.is_in_window(&at(2, 12)));
    }

    #[test]
    fn test_equal_hours_mean_all_day() {
        let schedule = UploadSchedule::new(ScheduleMode::Scheduled, 0, 0);
        assert!((0..24).all(|h| schedule.is_in_window(&at(1, h))));
    }

    #[test]
    fn test_completed_day_blocks_same_window_only() {
        let mut schedule = UploadSchedule::new(ScheduleMode::Scheduled, 22, 6);
        schedule.mark_day_completed(&at(1, 23));
        assert!(!schedule.is_upload_allowed(&at(2, 3)));
        assert!(schedule.is_upload_allowed(&at(2, 23)));
    }

    #[test]
    fn test_continuous_ignores_window() {
        let mut schedule = UploadSchedule::new(ScheduleMode::Continuous, 9, 10);
        schedule.mark_day_completed(&at(1, 9));
        assert!(schedule.is_upload_allowed(&at(1, 3)));
    }
}
