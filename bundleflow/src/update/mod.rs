//! Top-level update flow.
//!
//! An [`UpdateFlow`] brings the local manifest and cache up to the server's
//! resource version, one step per round trip:
//!
//! ```text
//! RequestVersion ─► RequestManifest ─► GetDownloadList ─► DownloadFiles ─► DownloadOver ─► Done
//!       │                 │                   │                                            ▲
//!       │                 └── same version ───┼────────────────────────────────────────────┘
//!       │                                     └── awaits BeginDownload when the list is non-empty
//!       └── app too old ──► MustReinstall
//! ```
//!
//! A failed step suspends the flow with an [`UpdateFailure`]. The operator
//! then sends `RetryStep`, `RewindToDownloadList` or `Abort`.

mod flow;
mod step;
mod version;

pub use flow::{FlowState, UpdateFlow, UpdateTarget};
pub use step::{
    OperatorSignal, Suspension, UpdateEvent, UpdateFailure, UpdateOutcome, UpdateStep,
};
pub use version::VersionDocument;
