use std::path::PathBuf;

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use super::JsonStore;
use crate::error::{CoreError, CoreResult};

/// Tag appended to the generated crontab line so operators can find and
/// replace it.
pub const TRIGGER_TAG: &str = "# tubevault-subscriptions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub enabled: bool,
    pub hour: u8,
    pub minute: u8,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            enabled: false,
            hour: 2,
            minute: 0,
        }
    }
}

impl Schedule {
    pub fn new(enabled: bool, hour: i64, minute: i64) -> CoreResult<Self> {
        if !(0..=23).contains(&hour) {
            return Err(CoreError::validation("Hour must be between 0 and 23"));
        }
        if !(0..=59).contains(&minute) {
            return Err(CoreError::validation("Minute must be between 0 and 59"));
        }
        Ok(Self {
            enabled,
            hour: hour as u8,
            minute: minute as u8,
        })
    }

    /// True when the schedule is enabled and `now` falls in the configured
    /// wall-clock minute.
    pub fn is_due(&self, now: &impl Timelike) -> bool {
        self.enabled && now.hour() == u32::from(self.hour) && now.minute() == u32::from(self.minute)
    }

    pub fn cron_expression(&self) -> String {
        format!("{} {} * * *", self.minute, self.hour)
    }

    /// Full crontab line that invokes `command` at the configured time.
    pub fn trigger_entry(&self, command: &str) -> String {
        format!("{} {} {}", self.cron_expression(), command.trim(), TRIGGER_TAG)
    }

    fn in_range(&self) -> bool {
        self.hour <= 23 && self.minute <= 59
    }
}

#[derive(Debug)]
pub struct ScheduleStore {
    inner: JsonStore<Schedule>,
}

impl ScheduleStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::load(path),
        }
    }

    pub fn get(&self) -> Schedule {
        let schedule = self.inner.get();
        if schedule.in_range() {
            schedule
        } else {
            tracing::warn!("stored schedule out of range, using defaults");
            Schedule::default()
        }
    }

    /// Validates before taking the lock; a rejected update changes nothing.
    pub fn update(&self, enabled: bool, hour: i64, minute: i64) -> CoreResult<Schedule> {
        let next = Schedule::new(enabled, hour, minute)?;
        self.inner.update(|current| {
            *current = next;
            Ok(next)
        })
    }
}
