//! Steps, signals and events of the update flow.

use std::fmt;

use crate::download::DownloadProgress;

/// Steps of the update flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStep {
    /// Fetch the remote version document.
    RequestVersion,
    /// Fetch the remote manifest.
    RequestManifest,
    /// Diff the remote manifest against the cache.
    GetDownloadList,
    /// Download the missing bundles.
    DownloadFiles,
    /// Persist the new local manifest.
    DownloadOver,
    /// The local state matches the server.
    Done,
    /// The server requires a newer app build.
    MustReinstall,
}

impl UpdateStep {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestVersion => "Requesting version",
            Self::RequestManifest => "Requesting manifest",
            Self::GetDownloadList => "Computing download list",
            Self::DownloadFiles => "Downloading",
            Self::DownloadOver => "Finishing download",
            Self::Done => "Done",
            Self::MustReinstall => "Reinstall required",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::MustReinstall)
    }
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operator decisions that resume a suspended flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorSignal {
    /// Accept the download list.
    BeginDownload,
    /// Run the failed step again.
    RetryStep,
    /// Go back to computing the download list after a download failure.
    RewindToDownloadList,
    /// Stop the flow.
    Abort,
}

impl fmt::Display for OperatorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeginDownload => write!(f, "begin-download"),
            Self::RetryStep => write!(f, "retry-step"),
            Self::RewindToDownloadList => write!(f, "rewind-to-download-list"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// What went wrong in a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFailure {
    pub step: UpdateStep,
    /// e.g. "fetch", "parse", "diff", "download", "save".
    pub operation: String,
    /// URL, path or bundle name involved.
    pub resource: String,
    pub message: String,
}

impl UpdateFailure {
    pub fn new(
        step: UpdateStep,
        operation: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step,
            operation: operation.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for UpdateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed during {} of {}: {}",
            self.step, self.operation, self.resource, self.message
        )
    }
}

/// Why the flow is waiting on the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspension {
    /// The download list is ready; waiting for `BeginDownload`.
    AwaitingConfirmation { files: usize, bytes: u64 },
    /// A step failed; waiting for `RetryStep`, `RewindToDownloadList` or
    /// `Abort`.
    Failed(UpdateFailure),
}

/// How the flow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// New bundles were downloaded and the local manifest replaced.
    Updated { resource_version: u32, files: usize },
    /// The local resource version already matched the server.
    UpToDate { resource_version: u32 },
    /// The app build is too old for the server's resources.
    MustReinstall { required: String, current: String },
    /// The operator aborted.
    Aborted,
}

/// Flow notifications, drained by the host once per tick.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    StepEntered(UpdateStep),
    Suspended(Suspension),
    StepFailed {
        step: UpdateStep,
        failure: UpdateFailure,
    },
    DownloadProgress(DownloadProgress),
    MustReinstall {
        required: String,
        current: String,
    },
    Finished(UpdateOutcome),
}
