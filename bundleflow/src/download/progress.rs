//! Progress reporting for download batches.
//!
//! Worker threads publish byte counts through lock-free [`TransferCounter`]s;
//! the polling loop aggregates them into [`DownloadProgress`] snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Point-in-time progress of a download batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub files_done: usize,
    pub bytes_done: u64,
    pub files_total: usize,
    pub bytes_total: u64,
}

impl DownloadProgress {
    /// Progress as a percentage based on bytes.
    ///
    /// Falls back to file-based progress if the total size is unknown.
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            if self.files_total == 0 {
                100.0
            } else {
                (self.files_done as f64 / self.files_total as f64) * 100.0
            }
        } else {
            (self.bytes_done.min(self.bytes_total) as f64 / self.bytes_total as f64) * 100.0
        }
    }

    /// Progress as a ratio (0.0 to 1.0).
    pub fn ratio(&self) -> f64 {
        self.percent() / 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.files_done == self.files_total
    }
}

/// Byte counter shared between a transfer thread and the polling loop.
#[derive(Debug, Clone, Default)]
pub struct TransferCounter {
    bytes: Arc<AtomicU64>,
}

impl TransferCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the cumulative byte count (called from the worker).
    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Watches a counter for stalls.
#[derive(Debug)]
pub struct StallWatch {
    last_bytes: u64,
    last_change: Instant,
}

impl StallWatch {
    pub fn new(now: Instant) -> Self {
        Self {
            last_bytes: 0,
            last_change: now,
        }
    }

    /// Record an observation and return how long the counter has not moved.
    pub fn observe(&mut self, bytes: u64, now: Instant) -> std::time::Duration {
        if bytes != self.last_bytes {
            self.last_bytes = bytes;
            self.last_change = now;
        }
        now.saturating_duration_since(self.last_change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_progress_by_files() {
        let progress = DownloadProgress {
            files_done: 1,
            bytes_done: 0,
            files_total: 4,
            bytes_total: 0,
        };
        assert_eq!(progress.percent(), 25.0);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_progress_by_bytes() {
        let progress = DownloadProgress {
            files_done: 0,
            bytes_done: 500,
            files_total: 2,
            bytes_total: 1000,
        };
        assert_eq!(progress.ratio(), 0.5);
    }

    #[test]
    fn test_empty_progress_is_complete() {
        let progress = DownloadProgress::default();
        assert_eq!(progress.percent(), 100.0);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_counter_shared() {
        let counter = TransferCounter::new();
        let clone = counter.clone();
        clone.set(42);
        assert_eq!(counter.get(), 42);
    }

    #[test]
    fn test_stall_watch() {
        let start = Instant::now();
        let mut watch = StallWatch::new(start);

        assert_eq!(watch.observe(0, start + Duration::from_secs(2)), Duration::from_secs(2));
        assert_eq!(watch.observe(10, start + Duration::from_secs(3)), Duration::ZERO);
        assert_eq!(watch.observe(10, start + Duration::from_secs(4)), Duration::from_secs(1));
    }
}
