//! Transport primitives for fetching manifests and bundle files.
//!
//! The engine never talks to the network directly; it goes through the
//! [`Transport`] trait so hosts can substitute their own HTTP stack and tests
//! can script responses.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;

use crate::error::{BundleError, BundleResult};

/// Default timeout for HTTP requests in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Buffer size for reading/writing during downloads (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Called with the cumulative number of bytes written so far.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Raw fetch primitives used by the update flow and the download pool.
///
/// Implementations must be shareable across worker threads.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Fetch a small text document (version file, manifest).
    fn get_text(&self, url: &str) -> BundleResult<String>;

    /// Stream a file to `dest`, reporting cumulative bytes written.
    ///
    /// Returns the number of bytes written.
    fn download(&self, url: &str, dest: &Path, on_progress: ProgressFn<'_>) -> BundleResult<u64>;
}

/// HTTP transport over a blocking reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with the default timeout.
    pub fn new() -> BundleResult<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a transport with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> BundleResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BundleError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> BundleError {
        if e.is_timeout() {
            BundleError::Timeout {
                url: url.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            BundleError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

impl Transport for HttpTransport {
    fn get_text(&self, url: &str) -> BundleResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| self.map_send_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BundleError::Network {
                url: url.to_string(),
                reason: format!("GET request failed with status {}", status),
            });
        }

        response.text().map_err(|e| BundleError::Network {
            url: url.to_string(),
            reason: format!("Read error: {}", e),
        })
    }

    fn download(&self, url: &str, dest: &Path, on_progress: ProgressFn<'_>) -> BundleResult<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| self.map_send_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BundleError::Network {
                url: url.to_string(),
                reason: format!("GET request failed with status {}", status),
            });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| BundleError::CreateDirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let file = File::create(dest).map_err(|e| BundleError::WriteFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;

        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut downloaded = 0u64;

        loop {
            let bytes_read = response
                .read(&mut buffer)
                .map_err(|e| BundleError::Network {
                    url: url.to_string(),
                    reason: format!("Read error: {}", e),
                })?;

            if bytes_read == 0 {
                break;
            }

            writer
                .write_all(&buffer[..bytes_read])
                .map_err(|e| BundleError::WriteFailed {
                    path: dest.to_path_buf(),
                    source: e,
                })?;

            downloaded += bytes_read as u64;
            on_progress(downloaded);
        }

        writer.flush().map_err(|e| BundleError::WriteFailed {
            path: dest.to_path_buf(),
            source: e,
        })?;

        Ok(downloaded)
    }
}
