//! Transfer progress delivered over a bounded channel.
//!
//! Producers never block: when the consumer falls behind, updates are
//! dropped and the next one supersedes them.

use serde::Serialize;
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub bytes_per_second: f64,
}

impl TransferProgress {
    pub fn new(bytes_transferred: u64, total_bytes: u64, elapsed_secs: f64) -> Self {
        let percent = if total_bytes == 0 {
            0.0
        } else {
            (bytes_transferred as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
        let bytes_per_second = if elapsed_secs > 0.0 {
            bytes_transferred as f64 / elapsed_secs
        } else {
            0.0
        };

        Self {
            bytes_transferred,
            total_bytes,
            percent,
            bytes_per_second,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<TransferProgress>,
}

pub fn progress_channel(capacity: usize) -> (ProgressReporter, mpsc::Receiver<TransferProgress>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ProgressReporter { tx }, rx)
}

impl ProgressReporter {
    /// Returns false when the update was dropped.
    pub fn report(&self, progress: TransferProgress) -> bool {
        self.tx.try_send(progress).is_ok()
    }
}

/// Tracks a single transfer and emits updates through an optional reporter.
pub(crate) struct TransferTracker<'a> {
    reporter: Option<&'a ProgressReporter>,
    total_bytes: u64,
    transferred: u64,
    started: Instant,
}

impl<'a> TransferTracker<'a> {
    pub(crate) fn new(reporter: Option<&'a ProgressReporter>, total_bytes: u64) -> Self {
        Self {
            reporter,
            total_bytes,
            transferred: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn advance(&mut self, bytes: u64) {
        self.transferred += bytes;
        if let Some(reporter) = self.reporter {
            reporter.report(TransferProgress::new(
                self.transferred,
                self.total_bytes,
                self.started.elapsed().as_secs_f64(),
            ));
        }
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred
    }
}
