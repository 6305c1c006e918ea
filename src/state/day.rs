use std::fmt;
use std::str::FromStr;

use super::StateError;

/// Calendar-day identifier of a `YYYYMMDD` data folder.
///
/// `DayKey::NONE` (zero) is the "no folder" sentinel used by the retry
/// context; it is never a member of the completed or pending sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DayKey(u32);

impl DayKey {
    pub const NONE: DayKey = DayKey(0);

    /// Parse a day token: literal `"0"` or exactly 8 ASCII digits.
    pub fn parse(token: &str) -> Result<DayKey, StateError> {
        if token == "0" {
            return Ok(DayKey::NONE);
        }
        if token.len() != 8 || !token.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StateError::InvalidDay(token.to_string()));
        }
        token
            .parse::<u32>()
            .map(DayKey)
            .map_err(|_| StateError::InvalidDay(token.to_string()))
    }

    /// Parse a folder name that must name a real day (the sentinel is rejected).
    pub fn from_folder(name: &str) -> Result<DayKey, StateError> {
        match DayKey::parse(name)? {
            DayKey::NONE => Err(StateError::InvalidDay(name.to_string())),
            day => Ok(day),
        }
    }

    pub fn from_date(date: chrono::NaiveDate) -> DayKey {
        use chrono::Datelike;
        DayKey(date.year() as u32 * 10_000 + date.month() * 100 + date.day())
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "0")
        } else {
            write!(f, "{:08}", self.0)
        }
    }
}

impl FromStr for DayKey {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DayKey::parse(s)
    }
}
