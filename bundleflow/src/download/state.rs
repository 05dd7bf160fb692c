//! Download state for a batch of bundle files.

use std::collections::VecDeque;

use crate::manifest::ManifestEntry;

/// Lifecycle of a download batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Issuing and running transfers.
    Running,
    /// No new transfers are issued; in-flight transfers continue.
    Paused,
    /// Every entry downloaded, verified and committed.
    Succeeded,
    /// An entry exhausted its retries.
    Failed,
    /// The caller discarded the batch.
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// State of one entry within a batch.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub entry: ManifestEntry,
    /// Failed attempts so far.
    pub failures: u32,
    /// Attempt number of the next (or current) transfer, 0-based.
    pub attempt: u32,
    /// Downloaded and verified.
    pub verified: bool,
}

/// Tracks pending, failed and verified entries of a batch.
#[derive(Debug, Clone)]
pub struct DownloadState {
    items: Vec<ItemState>,
    pending: VecDeque<usize>,
    verified_order: Vec<usize>,
    bytes_verified: u64,
}

impl DownloadState {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        let pending = (0..entries.len()).collect();
        let items = entries
            .into_iter()
            .map(|entry| ItemState {
                entry,
                failures: 0,
                attempt: 0,
                verified: false,
            })
            .collect();
        Self {
            items,
            pending,
            verified_order: Vec::new(),
            bytes_verified: 0,
        }
    }

    pub fn item(&self, index: usize) -> &ItemState {
        &self.items[index]
    }

    pub fn items(&self) -> &[ItemState] {
        &self.items
    }

    pub fn total_files(&self) -> usize {
        self.items.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|i| i.entry.size_bytes).sum()
    }

    pub fn verified_files(&self) -> usize {
        self.verified_order.len()
    }

    pub fn verified_bytes(&self) -> u64 {
        self.bytes_verified
    }

    /// Take the next entry waiting for a transfer.
    pub fn next_pending(&mut self) -> Option<usize> {
        self.pending.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Record a verified download.
    pub fn record_success(&mut self, index: usize) {
        let item = &mut self.items[index];
        if !item.verified {
            item.verified = true;
            self.bytes_verified += item.entry.size_bytes;
            self.verified_order.push(index);
        }
    }

    /// Record a failed attempt.
    ///
    /// Returns `true` if the entry is re-queued, `false` once it has failed
    /// more than `max_retries` times.
    pub fn record_failure(&mut self, index: usize, max_retries: u32) -> bool {
        let item = &mut self.items[index];
        item.failures += 1;
        item.attempt += 1;
        if item.failures > max_retries {
            false
        } else {
            // Retries go to the back so one bad file does not starve the rest
            self.pending.push_back(index);
            true
        }
    }

    /// Verified entries in completion order.
    pub fn verified_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.verified_order.iter().map(|&i| &self.items[i].entry)
    }

    pub fn all_verified(&self) -> bool {
        self.verified_order.len() == self.items.len()
    }
}
