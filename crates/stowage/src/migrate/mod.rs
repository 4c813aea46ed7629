pub mod orchestrator;
pub mod planner;
pub mod schedule;

use chrono::NaiveTime;
use std::time::Duration;

pub use orchestrator::{MigrationOrchestrator, MigrationResult};
pub use planner::{compute_metrics, Planner};
pub use schedule::{AlwaysAllowed, Clock, ExecutionPolicy, OffHoursWindow, SystemClock};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub what_if: bool,
    pub batch_size: usize,
    /// Start of the allowed execution window (local time of day).
    pub off_hours_start: Option<NaiveTime>,
    pub off_hours_end: Option<NaiveTime>,
    /// Plan copies instead of moves, renames and archives.
    pub non_destructive: bool,
    pub verify_hashes: bool,
    /// Re-attempts per operation on top of connector-level retries.
    pub max_retries: u32,
    /// How often a batch waiting for the execution window re-checks it.
    pub window_poll_interval: Duration,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            what_if: false,
            batch_size: DEFAULT_BATCH_SIZE,
            off_hours_start: None,
            off_hours_end: None,
            non_destructive: true,
            verify_hashes: true,
            max_retries: 3,
            window_poll_interval: Duration::from_secs(60),
        }
    }
}

impl MigrationOptions {
    /// The configured off-hours window, if both ends are set.
    pub fn off_hours_window(&self) -> Option<OffHoursWindow> {
        match (self.off_hours_start, self.off_hours_end) {
            (Some(start), Some(end)) => Some(OffHoursWindow::local(start, end)),
            _ => None,
        }
    }
}
