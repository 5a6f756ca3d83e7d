use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

pub const HOURLY: &str = "hourly";
pub const TWICE_DAILY: &str = "twicedaily";
pub const DAILY: &str = "daily";
pub const WEEKLY: &str = "weekly";
/// Schedules used only by internal events.
pub const INTERNAL_MINUTE: &str = "cron_control_minute";
pub const INTERNAL_TEN_MINUTES: &str = "cron_control_ten_minutes";

/// Named recurrence intervals, in seconds.
///
/// Rescheduling looks the interval up here on every run, so redefining a
/// schedule takes effect on the next occurrence of each event using it.
pub struct Schedules {
    intervals: RwLock<HashMap<String, i64>>,
}

impl Schedules {
    pub fn new() -> Self {
        let builtin = [
            (HOURLY, 60 * 60),
            (TWICE_DAILY, 12 * 60 * 60),
            (DAILY, 24 * 60 * 60),
            (WEEKLY, 7 * 24 * 60 * 60),
            (INTERNAL_MINUTE, 2 * 60),
            (INTERNAL_TEN_MINUTES, 10 * 60),
        ];
        Self {
            intervals: RwLock::new(
                builtin
                    .into_iter()
                    .map(|(name, secs)| (name.to_string(), secs))
                    .collect(),
            ),
        }
    }

    /// Add or redefine a schedule. Non-positive intervals are ignored.
    pub fn register(&self, name: &str, interval_secs: i64) -> bool {
        if name.is_empty() || interval_secs <= 0 {
            return false;
        }
        let mut intervals = self.intervals.write().unwrap_or_else(PoisonError::into_inner);
        intervals.insert(name.to_string(), interval_secs);
        debug!(schedule = name, interval_secs, "schedule registered");
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut intervals = self.intervals.write().unwrap_or_else(PoisonError::into_inner);
        intervals.remove(name).is_some()
    }

    pub fn interval(&self, name: &str) -> Option<i64> {
        let intervals = self.intervals.read().unwrap_or_else(PoisonError::into_inner);
        intervals.get(name).copied()
    }

    /// All schedules, shortest interval first.
    pub fn list(&self) -> Vec<(String, i64)> {
        let intervals = self.intervals.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = intervals.iter().map(|(k, v)| (k.clone(), *v)).collect();
        all.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        all
    }
}

impl Default for Schedules {
    fn default() -> Self {
        Self::new()
    }
}
