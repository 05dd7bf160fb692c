//! Download orchestration.
//!
//! A [`Downloader`] owns one batch of manifest entries. Transfers run on
//! worker threads bounded by `max_concurrent`; their outcomes travel back over
//! a channel and are merged into the batch state only inside [`Downloader::poll`],
//! which the host calls once per tick.
//!
//! Each worker downloads into a per-attempt partial file, verifies it, and
//! renames it to its content-addressed cache path. The cache index itself is
//! only written from `poll`:
//!
//! - full success commits every entry in one batch
//! - a terminal failure commits the entries that verified before it
//! - cancellation commits nothing
//!
//! A stalled transfer is abandoned and retried, but its worker keeps its slot
//! under `max_concurrent` until it reports back, so no more than
//! `max_concurrent` workers ever run at once.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::progress::{DownloadProgress, StallWatch, TransferCounter};
use super::remote::RemoteServices;
use super::state::{BatchStatus, DownloadState};
use super::transport::Transport;
use crate::cache::{CacheStore, StorageLayout};
use crate::error::{BundleError, BundleResult};
use crate::manifest::ManifestEntry;
use crate::verify::{verify_file, VerifyLevel};

/// Default number of simultaneous transfers.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default time without byte progress before a transfer is abandoned.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and what to download.
#[derive(Debug, Clone)]
pub struct DownloadContext {
    pub transport: Arc<dyn Transport>,
    pub remote: RemoteServices,
    pub resource_version: u32,
    pub layout: StorageLayout,
}

impl DownloadContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        remote: RemoteServices,
        resource_version: u32,
        layout: StorageLayout,
    ) -> Self {
        Self {
            transport,
            remote,
            resource_version,
            layout,
        }
    }
}

/// Tuning for a download batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub stall_timeout: Duration,
    pub verify_level: VerifyLevel,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_retries: DEFAULT_MAX_RETRIES,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            verify_level: VerifyLevel::default(),
        }
    }
}

impl DownloadOptions {
    /// Set the concurrency bound (minimum 1).
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_verify_level(mut self, level: VerifyLevel) -> Self {
        self.verify_level = level;
        self
    }
}

/// Notable per-file events, drained by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    FileStarted {
        name: String,
        attempt: u32,
        url: String,
    },
    FileVerified {
        name: String,
        bytes: u64,
    },
    FileFailed {
        name: String,
        attempt: u32,
        reason: String,
        will_retry: bool,
    },
}

/// A transfer the batch is waiting on.
#[derive(Debug)]
struct Transfer {
    attempt: u32,
    url: String,
    counter: TransferCounter,
    watch: StallWatch,
}

/// Message from a worker thread.
#[derive(Debug)]
struct TransferOutcome {
    index: usize,
    attempt: u32,
    result: BundleResult<u64>,
}

/// Downloads one batch of entries into the cache.
#[derive(Debug)]
pub struct Downloader {
    context: DownloadContext,
    options: DownloadOptions,
    batch_tag: String,
    state: DownloadState,
    status: BatchStatus,
    in_flight: HashMap<usize, Transfer>,
    /// `(index, attempt)` of stalled transfers whose workers are still running.
    abandoned: HashSet<(usize, u32)>,
    tx: Sender<TransferOutcome>,
    rx: Receiver<TransferOutcome>,
    events: Vec<DownloadEvent>,
    last_error: Option<BundleError>,
    committed: bool,
    peak_in_flight: usize,
}

impl Downloader {
    /// Start a batch. No transfer is issued until the first `poll`.
    pub fn submit(
        context: DownloadContext,
        entries: Vec<ManifestEntry>,
        options: DownloadOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let batch_tag = format!("{:x}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let state = DownloadState::new(entries);

        info!(
            batch = %batch_tag,
            files = state.total_files(),
            bytes = state.total_bytes(),
            max_concurrent = options.max_concurrent,
            "Download batch submitted"
        );

        Self {
            context,
            options,
            batch_tag,
            state,
            status: BatchStatus::Running,
            in_flight: HashMap::new(),
            abandoned: HashSet::new(),
            tx,
            rx,
            events: Vec::new(),
            last_error: None,
            committed: false,
            peak_in_flight: 0,
        }
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// The most recent failure, naming the bundle or URL involved.
    pub fn last_error(&self) -> Option<&BundleError> {
        self.last_error.as_ref()
    }

    pub fn take_last_error(&mut self) -> Option<BundleError> {
        self.last_error.take()
    }

    /// Transfers currently tracked.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Abandoned transfers whose workers have not reported back.
    pub fn abandoned(&self) -> usize {
        self.abandoned.len()
    }

    /// Highest number of workers running at once, abandoned ones included.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    /// Whether the batch reached a terminal status with nothing in flight.
    pub fn is_done(&self) -> bool {
        self.status.is_terminal() && self.in_flight.is_empty() && self.committed
    }

    /// Stop issuing new transfers. In-flight transfers continue.
    pub fn pause(&mut self) {
        if self.status == BatchStatus::Running {
            debug!(batch = %self.batch_tag, "Download batch paused");
            self.status = BatchStatus::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.status == BatchStatus::Paused {
            debug!(batch = %self.batch_tag, "Download batch resumed");
            self.status = BatchStatus::Running;
        }
    }

    /// Discard the batch. Nothing is committed.
    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            info!(batch = %self.batch_tag, "Download batch cancelled");
            self.status = BatchStatus::Cancelled;
            self.state.clear_pending();
            self.last_error = Some(BundleError::Cancelled);
        }
    }

    /// Take the events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<DownloadEvent> {
        std::mem::take(&mut self.events)
    }

    /// Snapshot of verified work plus bytes in flight.
    pub fn progress(&self) -> DownloadProgress {
        let in_flight_bytes: u64 = self.in_flight.values().map(|t| t.counter.get()).sum();
        DownloadProgress {
            files_done: self.state.verified_files(),
            bytes_done: self.state.verified_bytes() + in_flight_bytes,
            files_total: self.state.total_files(),
            bytes_total: self.state.total_bytes(),
        }
    }

    /// Advance the batch. Returns `true` once the batch is done.
    ///
    /// Merges finished transfers, abandons stalled ones, issues new transfers
    /// up to the concurrency bound, and commits to `cache` when the batch
    /// completes.
    pub fn poll(&mut self, cache: &mut CacheStore) -> bool {
        if self.is_done() {
            return true;
        }

        while let Ok(outcome) = self.rx.try_recv() {
            self.merge(outcome);
        }
        self.check_stalls(Instant::now());

        if self.status == BatchStatus::Running {
            if self.state.all_verified() {
                self.status = BatchStatus::Succeeded;
            } else {
                self.issue();
            }
        }

        if self.status.is_terminal() && self.in_flight.is_empty() && !self.committed {
            self.commit(cache);
        }
        self.is_done()
    }

    fn merge(&mut self, outcome: TransferOutcome) {
        if self.abandoned.remove(&(outcome.index, outcome.attempt)) {
            debug!(
                index = outcome.index,
                attempt = outcome.attempt,
                "Abandoned transfer finished, slot released"
            );
            return;
        }
        let current = matches!(
            self.in_flight.get(&outcome.index),
            Some(t) if t.attempt == outcome.attempt
        );
        if !current {
            debug!(
                index = outcome.index,
                attempt = outcome.attempt,
                "Ignoring outcome of unknown transfer"
            );
            return;
        }
        self.in_flight.remove(&outcome.index);

        if matches!(self.status, BatchStatus::Failed | BatchStatus::Cancelled) {
            return;
        }

        match outcome.result {
            Ok(bytes) => {
                let name = self.state.item(outcome.index).entry.name.clone();
                debug!(bundle = %name, bytes, "Bundle downloaded and verified");
                self.state.record_success(outcome.index);
                self.events.push(DownloadEvent::FileVerified { name, bytes });
            }
            Err(e) => self.fail_attempt(outcome.index, outcome.attempt, e),
        }
    }

    fn fail_attempt(&mut self, index: usize, attempt: u32, err: BundleError) {
        let will_retry = self.state.record_failure(index, self.options.max_retries);
        let name = self.state.item(index).entry.name.clone();

        if will_retry {
            warn!(bundle = %name, attempt, error = %err, "Download attempt failed, retrying");
        } else {
            error!(bundle = %name, attempt, error = %err, "Download failed, retries exhausted");
        }
        self.events.push(DownloadEvent::FileFailed {
            name,
            attempt,
            reason: err.to_string(),
            will_retry,
        });
        self.last_error = Some(err);

        if !will_retry && !self.status.is_terminal() {
            self.status = BatchStatus::Failed;
            self.state.clear_pending();
        }
    }

    fn check_stalls(&mut self, now: Instant) {
        let timeout = self.options.stall_timeout;
        let stalled: Vec<usize> = self
            .in_flight
            .iter_mut()
            .filter_map(|(&index, t)| {
                (t.watch.observe(t.counter.get(), now) >= timeout).then_some(index)
            })
            .collect();

        for index in stalled {
            if let Some(transfer) = self.in_flight.remove(&index) {
                self.abandoned.insert((index, transfer.attempt));
                if matches!(self.status, BatchStatus::Failed | BatchStatus::Cancelled) {
                    continue;
                }
                let err = BundleError::Timeout {
                    url: transfer.url,
                    secs: timeout.as_secs(),
                };
                self.fail_attempt(index, transfer.attempt, err);
            }
        }
    }

    fn issue(&mut self) {
        while self.running() < self.options.max_concurrent {
            let Some(index) = self.state.next_pending() else {
                break;
            };
            self.spawn(index);
        }
        self.peak_in_flight = self.peak_in_flight.max(self.running());
    }

    /// Workers currently running, tracked or abandoned.
    fn running(&self) -> usize {
        self.in_flight.len() + self.abandoned.len()
    }

    fn spawn(&mut self, index: usize) {
        let item = self.state.item(index);
        let entry = item.entry.clone();
        let attempt = item.attempt;
        let url =
            self.context
                .remote
                .bundle_url(self.context.resource_version, &entry.content_hash, attempt);
        let partial = self.context.layout.partial_file(
            &entry.content_hash,
            &format!("{}-{}", self.batch_tag, attempt),
        );
        let target = self.context.layout.cached_file(&entry.content_hash);
        let counter = TransferCounter::new();

        debug!(bundle = %entry.name, attempt, url = %url, "Starting transfer");
        self.events.push(DownloadEvent::FileStarted {
            name: entry.name.clone(),
            attempt,
            url: url.clone(),
        });
        self.in_flight.insert(
            index,
            Transfer {
                attempt,
                url: url.clone(),
                counter: counter.clone(),
                watch: StallWatch::new(Instant::now()),
            },
        );

        let transport = Arc::clone(&self.context.transport);
        let level = self.options.verify_level;
        let tx = self.tx.clone();

        thread::spawn(move || {
            let result = transport
                .download(&url, &partial, &|bytes| counter.set(bytes))
                .and_then(|bytes| {
                    verify_file(&partial, &entry, level)?;
                    fs::rename(&partial, &target).map_err(|e| BundleError::WriteFailed {
                        path: target.clone(),
                        source: e,
                    })?;
                    Ok(bytes)
                });
            if result.is_err() {
                let _ = fs::remove_file(&partial);
            }
            // The downloader may have been dropped
            let _ = tx.send(TransferOutcome {
                index,
                attempt,
                result,
            });
        });
    }

    fn commit(&mut self, cache: &mut CacheStore) {
        self.committed = true;
        let hashes: Vec<String> = match self.status {
            BatchStatus::Succeeded | BatchStatus::Failed => self
                .state
                .verified_entries()
                .map(|e| e.content_hash.clone())
                .collect(),
            _ => Vec::new(),
        };

        if hashes.is_empty() {
            debug!(batch = %self.batch_tag, status = ?self.status, "Nothing to commit");
            return;
        }

        match cache.commit_batch(&hashes) {
            Ok(inserted) => info!(
                batch = %self.batch_tag,
                status = ?self.status,
                committed = inserted,
                "Download batch committed"
            ),
            Err(e) => {
                error!(batch = %self.batch_tag, error = %e, "Failed to commit download batch");
                self.status = BatchStatus::Failed;
                self.last_error = Some(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::memory::{Fault, MemoryTransport};
    use crate::verify::digest_bytes;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        transport: Arc<MemoryTransport>,
        cache: CacheStore,
        context: DownloadContext,
    }

    fn fixture(transport: MemoryTransport) -> Fixture {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path().join("builtin"), temp.path().join("sandbox"));
        let (cache, _) = CacheStore::open(layout.clone(), "1.0.0").unwrap();
        let transport = Arc::new(transport);
        let context = DownloadContext::new(
            transport.clone(),
            RemoteServices::new("http://primary", "http://fallback", "manifest.json"),
            3,
            layout,
        );
        Fixture {
            _temp: temp,
            transport,
            cache,
            context,
        }
    }

    fn publish(transport: &MemoryTransport, name: &str, data: &[u8]) -> ManifestEntry {
        let digest = digest_bytes(data);
        transport.serve(format!("3/{}", digest.content_hash), data.to_vec());
        ManifestEntry::new(name, digest.content_hash, digest.checksum, digest.size_bytes, 3)
    }

    fn run(downloader: &mut Downloader, cache: &mut CacheStore) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !downloader.poll(cache) {
            assert!(Instant::now() < deadline, "download did not finish");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_empty_batch_succeeds() {
        let mut fx = fixture(MemoryTransport::new());
        let mut downloader =
            Downloader::submit(fx.context.clone(), vec![], DownloadOptions::default());

        assert!(downloader.poll(&mut fx.cache));
        assert_eq!(downloader.status(), BatchStatus::Succeeded);
        assert!(downloader.progress().is_complete());
    }

    #[test]
    fn test_batch_success_commits_all() {
        let mut fx = fixture(MemoryTransport::new());
        let a = publish(&fx.transport, "a", b"alpha");
        let b = publish(&fx.transport, "b", b"bravo!");

        let mut downloader = Downloader::submit(
            fx.context.clone(),
            vec![a.clone(), b.clone()],
            DownloadOptions::default(),
        );
        run(&mut downloader, &mut fx.cache);

        assert_eq!(downloader.status(), BatchStatus::Succeeded);
        assert!(fx.cache.contains(&a.content_hash));
        assert!(fx.cache.contains(&b.content_hash));
        assert_eq!(fx.cache.stats().flushes, 2);
        assert_eq!(
            fs::read(fx.cache.cached_path(&b.content_hash)).unwrap(),
            b"bravo!"
        );

        let progress = downloader.progress();
        assert_eq!(progress.files_done, 2);
        assert_eq!(progress.bytes_done, 11);
    }

    #[test]
    fn test_retry_alternates_hosts() {
        let mut fx = fixture(MemoryTransport::new());
        let a = publish(&fx.transport, "a", b"alpha");
        let key = format!("3/{}", a.content_hash);
        fx.transport.push_fault(key.clone(), Fault::Fail("reset".to_string()));
        fx.transport.push_fault(key.clone(), Fault::Corrupt);

        let mut downloader =
            Downloader::submit(fx.context.clone(), vec![a.clone()], DownloadOptions::default());
        run(&mut downloader, &mut fx.cache);

        assert_eq!(downloader.status(), BatchStatus::Succeeded);
        let hosts: Vec<_> = fx
            .transport
            .requests()
            .into_iter()
            .map(|u| u.split('/').nth(2).unwrap().to_string())
            .collect();
        assert_eq!(hosts, vec!["primary", "fallback", "primary"]);
        assert!(matches!(
            downloader.last_error(),
            Some(BundleError::Integrity { .. })
        ));
    }

    #[test]
    fn test_exhausted_retries_fail_batch() {
        let mut fx = fixture(MemoryTransport::new());
        let a = publish(&fx.transport, "a", b"alpha");
        let missing = ManifestEntry::new("gone", "f".repeat(64), "00000000", 4, 3);

        let options = DownloadOptions::default()
            .with_max_retries(1)
            .with_max_concurrent(1);
        let mut downloader =
            Downloader::submit(fx.context.clone(), vec![a.clone(), missing], options);
        run(&mut downloader, &mut fx.cache);

        assert_eq!(downloader.status(), BatchStatus::Failed);
        assert_eq!(fx.transport.request_count(&"f".repeat(64)), 2);
        // "a" verified before the failure and is kept
        assert!(fx.cache.contains(&a.content_hash));
        assert_eq!(fx.cache.len(), 1);
        assert!(downloader
            .last_error()
            .unwrap()
            .to_string()
            .contains("404"));
    }

    #[test]
    fn test_stalled_transfer_counts_as_failure() {
        let mut fx = fixture(MemoryTransport::new());
        let a = publish(&fx.transport, "a", b"alpha");
        fx.transport.push_fault(
            format!("3/{}", a.content_hash),
            Fault::Stall(Duration::from_millis(300)),
        );

        let options = DownloadOptions::default().with_stall_timeout(Duration::from_millis(50));
        let mut downloader = Downloader::submit(fx.context.clone(), vec![a.clone()], options);
        run(&mut downloader, &mut fx.cache);

        assert_eq!(downloader.status(), BatchStatus::Succeeded);
        let failures: Vec<_> = downloader
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, DownloadEvent::FileFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_abandoned_transfer_keeps_its_slot() {
        let mut fx = fixture(MemoryTransport::new().with_delay(Duration::from_millis(20)));
        let a = publish(&fx.transport, "a", b"alpha");
        let b = publish(&fx.transport, "b", b"bravo");
        fx.transport.push_fault(
            format!("3/{}", a.content_hash),
            Fault::Stall(Duration::from_millis(400)),
        );

        let options = DownloadOptions::default()
            .with_max_concurrent(1)
            .with_stall_timeout(Duration::from_millis(100));
        let mut downloader =
            Downloader::submit(fx.context.clone(), vec![a.clone(), b.clone()], options);

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut saw_abandoned = false;
        while !downloader.poll(&mut fx.cache) {
            if downloader.abandoned() > 0 {
                saw_abandoned = true;
                assert_eq!(downloader.in_flight(), 0);
            }
            assert!(Instant::now() < deadline, "download did not finish");
            thread::sleep(Duration::from_millis(2));
        }

        assert!(saw_abandoned);
        assert_eq!(downloader.status(), BatchStatus::Succeeded);
        assert_eq!(fx.transport.peak_concurrency(), 1);
        assert_eq!(downloader.peak_in_flight(), 1);
        assert!(fx.cache.contains(&a.content_hash));
        assert!(fx.cache.contains(&b.content_hash));
    }

    #[test]
    fn test_cancel_commits_nothing() {
        let mut fx = fixture(MemoryTransport::new().with_delay(Duration::from_millis(30)));
        let a = publish(&fx.transport, "a", b"alpha");

        let mut downloader =
            Downloader::submit(fx.context.clone(), vec![a.clone()], DownloadOptions::default());
        assert!(!downloader.poll(&mut fx.cache));
        downloader.cancel();
        run(&mut downloader, &mut fx.cache);

        assert_eq!(downloader.status(), BatchStatus::Cancelled);
        assert!(fx.cache.is_empty());
    }

    #[test]
    fn test_pause_holds_new_transfers() {
        let mut fx = fixture(MemoryTransport::new());
        let a = publish(&fx.transport, "a", b"alpha");

        let mut downloader =
            Downloader::submit(fx.context.clone(), vec![a], DownloadOptions::default());
        downloader.pause();
        assert!(!downloader.poll(&mut fx.cache));
        assert_eq!(downloader.in_flight(), 0);
        assert!(fx.transport.requests().is_empty());

        downloader.resume();
        run(&mut downloader, &mut fx.cache);
        assert_eq!(downloader.status(), BatchStatus::Succeeded);
    }
}
