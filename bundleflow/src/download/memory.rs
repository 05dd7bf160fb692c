//! In-memory transport.
//!
//! Serves documents and bundle files from memory, keyed by URL path suffix,
//! so the same content answers on every host. Faults can be queued per key
//! to exercise retry, host alternation and stall handling.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::transport::{ProgressFn, Transport};
use crate::error::{BundleError, BundleResult};

/// A scripted failure consumed by the next matching request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a network error.
    Fail(String),
    /// Serve the content with its first byte flipped.
    Corrupt,
    /// Sleep without reporting progress, then fail.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<String, Vec<u8>>,
    faults: HashMap<String, VecDeque<Fault>>,
    requests: Vec<String>,
}

/// Transport serving content from memory.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every file transfer, to keep transfers in flight across polls.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Serve `data` for every URL ending in `/{key}`.
    pub fn serve(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.inner.lock().files.insert(key.into(), data.into());
    }

    /// Stop serving `key`.
    pub fn remove(&self, key: &str) {
        self.inner.lock().files.remove(key);
    }

    /// Queue a fault for the next request ending in `/{key}`.
    pub fn push_fault(&self, key: impl Into<String>, fault: Fault) {
        self.inner
            .lock()
            .faults
            .entry(key.into())
            .or_default()
            .push_back(fault);
    }

    /// All URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.inner.lock().requests.clone()
    }

    /// Number of requested URLs ending in `/{key}`.
    pub fn request_count(&self, key: &str) -> usize {
        let suffix = format!("/{}", key);
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|u| u.ends_with(&suffix))
            .count()
    }

    /// Highest number of simultaneous file transfers observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Record the request and resolve it to content or a fault.
    fn lookup(&self, url: &str) -> (Option<Vec<u8>>, Option<Fault>) {
        let mut inner = self.inner.lock();
        inner.requests.push(url.to_string());

        let key = inner
            .files
            .keys()
            .chain(inner.faults.keys())
            .find(|k| url.ends_with(&format!("/{}", k)))
            .cloned();
        let Some(key) = key else {
            return (None, None);
        };

        let fault = inner.faults.get_mut(&key).and_then(|q| q.pop_front());
        (inner.files.get(&key).cloned(), fault)
    }

    fn not_found(url: &str) -> BundleError {
        BundleError::Network {
            url: url.to_string(),
            reason: "GET request failed with status 404 Not Found".to_string(),
        }
    }
}

impl Transport for MemoryTransport {
    fn get_text(&self, url: &str) -> BundleResult<String> {
        match self.lookup(url) {
            (_, Some(Fault::Fail(reason))) => Err(BundleError::Network {
                url: url.to_string(),
                reason,
            }),
            (_, Some(Fault::Stall(_))) => Err(BundleError::Timeout {
                url: url.to_string(),
                secs: 0,
            }),
            (Some(data), fault) => {
                let mut data = data;
                if fault == Some(Fault::Corrupt) {
                    data.truncate(data.len() / 2);
                }
                String::from_utf8(data).map_err(|e| BundleError::Network {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            (None, _) => Err(Self::not_found(url)),
        }
    }

    fn download(&self, url: &str, dest: &Path, on_progress: ProgressFn<'_>) -> BundleResult<u64> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = (|| {
            let (data, fault) = self.lookup(url);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }

            let mut data = match (data, fault) {
                (_, Some(Fault::Fail(reason))) => {
                    return Err(BundleError::Network {
                        url: url.to_string(),
                        reason,
                    })
                }
                (_, Some(Fault::Stall(duration))) => {
                    thread::sleep(duration);
                    return Err(BundleError::Network {
                        url: url.to_string(),
                        reason: "connection reset".to_string(),
                    });
                }
                (Some(data), Some(Fault::Corrupt)) => {
                    let mut data = data;
                    if let Some(first) = data.first_mut() {
                        *first = !*first;
                    }
                    data
                }
                (Some(data), None) => data,
                (None, _) => return Err(Self::not_found(url)),
            };

            fs::write(dest, &data).map_err(|e| BundleError::WriteFailed {
                path: dest.to_path_buf(),
                source: e,
            })?;
            let len = data.len() as u64;
            on_progress(len);
            data.clear();
            Ok(len)
        })();

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
