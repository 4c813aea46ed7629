//! Execution windows.
//!
//! The orchestrator asks an [`ExecutionPolicy`] before every batch and waits
//! while the answer is no. Time comes from an injected [`Clock`].

use chrono::{DateTime, FixedOffset, Local, NaiveTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub trait ExecutionPolicy: Send + Sync {
    fn is_execution_allowed(&self, now: DateTime<Utc>) -> bool;
}

impl<F> ExecutionPolicy for F
where
    F: Fn(DateTime<Utc>) -> bool + Send + Sync,
{
    fn is_execution_allowed(&self, now: DateTime<Utc>) -> bool {
        self(now)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllowed;

impl ExecutionPolicy for AlwaysAllowed {
    fn is_execution_allowed(&self, _now: DateTime<Utc>) -> bool {
        true
    }
}

/// Daily window `[start, end)`. A window with `start > end` wraps past
/// midnight; `start == end` allows the whole day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffHoursWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Offset used to read the time of day; `None` follows the system zone.
    pub utc_offset: Option<FixedOffset>,
}

impl OffHoursWindow {
    pub fn local(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            utc_offset: None,
        }
    }

    pub fn with_offset(start: NaiveTime, end: NaiveTime, offset: FixedOffset) -> Self {
        Self {
            start,
            end,
            utc_offset: Some(offset),
        }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    fn time_of_day(&self, now: DateTime<Utc>) -> NaiveTime {
        match self.utc_offset {
            Some(offset) => now.with_timezone(&offset).time(),
            None => now.with_timezone(&Local).time(),
        }
    }
}

impl ExecutionPolicy for OffHoursWindow {
    fn is_execution_allowed(&self, now: DateTime<Utc>) -> bool {
        self.contains(self.time_of_day(now))
    }
}
