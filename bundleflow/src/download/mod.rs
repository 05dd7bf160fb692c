//! Bundle download pool.
//!
//! - [`transport`] - raw fetch primitives (`Transport`, reqwest-backed `HttpTransport`)
//! - [`remote`] - primary/fallback URL layout
//! - [`orchestrator`] - the batch [`Downloader`] polled from the host loop
//! - [`memory`] - in-memory transport for tests and offline hosts

pub mod memory;
pub mod orchestrator;
pub mod progress;
pub mod remote;
pub mod state;
pub mod transport;

pub use memory::{Fault, MemoryTransport};
pub use orchestrator::{
    DownloadContext, DownloadEvent, DownloadOptions, Downloader, DEFAULT_MAX_CONCURRENT,
    DEFAULT_MAX_RETRIES, DEFAULT_STALL_TIMEOUT,
};
pub use progress::DownloadProgress;
pub use remote::{RemoteServices, VERSION_FILENAME};
pub use state::BatchStatus;
pub use transport::{HttpTransport, Transport, DEFAULT_TIMEOUT_SECS};
