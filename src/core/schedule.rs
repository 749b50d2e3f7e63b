//! Daily UTC schedule.
//!
//! A pipeline is scheduled once per day at a fixed UTC time of day, written
//! as `HH:MM` in the configuration.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use std::time::Duration;

/// One fixed UTC time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    time: NaiveTime,
}

impl DailySchedule {
    /// Creates a schedule firing at `hour:minute` UTC.
    #[must_use]
    pub fn at(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(|time| Self { time })
    }

    /// Returns the first fire time strictly after `now`.
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = Utc.from_utc_datetime(&now.date_naive().and_time(self.time));
        if today > now {
            today
        } else {
            today + chrono::Duration::days(1)
        }
    }

    /// Returns how long to sleep from `now` until the next fire time.
    #[must_use]
    pub fn until_next(&self, now: DateTime<Utc>) -> Duration {
        (self.next_after(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} UTC", self.time.format("%H:%M"))
    }
}

impl std::str::FromStr for DailySchedule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || format!("Invalid schedule: {s}. Expected HH:MM (UTC)");

        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }

        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;

        Self::at(hour, minute).ok_or_else(invalid)
    }
}
