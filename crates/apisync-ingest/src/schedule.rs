//! Watch-mode scheduling
//!
//! Inside the active window incremental syncs run back to back, separated
//! by the configured interval. Outside it, one backup is taken per night.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default minutes between incremental syncs
pub const DEFAULT_INTERVAL_MINS: u64 = 30;

/// Default start of the active window (local hour, inclusive)
pub const DEFAULT_WINDOW_START_HOUR: u32 = 6;

/// Default end of the active window (local hour, exclusive)
pub const DEFAULT_WINDOW_END_HOUR: u32 = 18;

/// Watch loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleSettings {
    /// Look-back of each incremental sync, in days
    pub days: u32,
    pub interval_mins: u64,
    pub start_hour: u32,
    pub end_hour: u32,
    pub weekdays_only: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            days: 0,
            interval_mins: DEFAULT_INTERVAL_MINS,
            start_hour: DEFAULT_WINDOW_START_HOUR,
            end_hour: DEFAULT_WINDOW_END_HOUR,
            weekdays_only: true,
        }
    }
}

impl ScheduleSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_mins == 0 {
            anyhow::bail!("Schedule interval_mins must be greater than 0");
        }
        if self.start_hour >= self.end_hour || self.end_hour > 24 {
            anyhow::bail!(
                "Schedule window {}:00-{}:00 is not a valid daytime range",
                self.start_hour,
                self.end_hour
            );
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_mins.saturating_mul(60))
    }

    /// Whether `now` (local time) falls inside the active window
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        let weekday_ok =
            !self.weekdays_only || !matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
        weekday_ok && (self.start_hour..self.end_hour).contains(&now.hour())
    }

    /// Whether `now` is night time, when backups are taken
    pub fn is_night(&self, now: NaiveDateTime) -> bool {
        now.hour() >= self.end_hour || now.hour() < self.start_hour
    }
}

/// What the watch loop does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStep {
    Sync,
    Backup,
    Idle,
}

/// Tracks whether tonight's backup has been taken
#[derive(Debug, Clone, Default)]
pub struct WatchState {
    backed_up: bool,
}

impl WatchState {
    /// Decide the next step and update the state as if it ran
    ///
    /// The backup flag resets after each sync, so a backup runs once per
    /// stretch of nights between two active windows.
    pub fn next(&mut self, schedule: &ScheduleSettings, now: NaiveDateTime) -> WatchStep {
        if schedule.is_active(now) {
            self.backed_up = false;
            WatchStep::Sync
        } else if schedule.is_night(now) && !self.backed_up {
            self.backed_up = true;
            WatchStep::Backup
        } else {
            WatchStep::Idle
        }
    }
}
