//! The update flow state machine.
//!
//! Network round trips run on worker threads; a tick only checks whether
//! the pending fetch has answered, so the host loop never waits on I/O.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use super::step::{
    OperatorSignal, Suspension, UpdateEvent, UpdateFailure, UpdateOutcome, UpdateStep,
};
use super::version::VersionDocument;
use crate::cache::CacheStore;
use crate::diff::{download_list, DownloadList, DownloadScope};
use crate::download::{
    BatchStatus, DownloadContext, DownloadOptions, DownloadProgress, Downloader, RemoteServices,
    Transport,
};
use crate::error::{BundleError, BundleResult};
use crate::manifest::Manifest;

/// Local state the flow reads and replaces.
#[derive(Debug)]
pub struct UpdateTarget<'a> {
    pub builtin: &'a Manifest,
    pub local: &'a mut Manifest,
    pub cache: &'a mut CacheStore,
}

/// Whether the flow is advancing, waiting on the operator, or over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Running,
    Suspended(Suspension),
    Finished(UpdateOutcome),
}

/// A text document being fetched on a worker thread.
#[derive(Debug)]
struct PendingFetch {
    url: String,
    rx: Receiver<BundleResult<String>>,
}

/// One update of the local resources to the server's resource version.
#[derive(Debug)]
pub struct UpdateFlow {
    transport: Arc<dyn Transport>,
    remote: RemoteServices,
    options: DownloadOptions,
    scope: DownloadScope,
    app_version: String,
    step: UpdateStep,
    state: FlowState,
    /// Round trips tried at the current step, selects the host.
    attempt: u32,
    version: Option<VersionDocument>,
    manifest: Option<Manifest>,
    list: Option<DownloadList>,
    downloader: Option<Downloader>,
    last_progress: Option<DownloadProgress>,
    pending: Option<PendingFetch>,
    events: Vec<UpdateEvent>,
}

impl UpdateFlow {
    /// Start a flow at `RequestVersion`. Nothing runs until the first tick.
    pub fn new(
        transport: Arc<dyn Transport>,
        remote: RemoteServices,
        options: DownloadOptions,
        scope: DownloadScope,
        app_version: impl Into<String>,
    ) -> Self {
        info!(scope = %scope, "Update started");
        Self {
            transport,
            remote,
            options,
            scope,
            app_version: app_version.into(),
            step: UpdateStep::RequestVersion,
            state: FlowState::Running,
            attempt: 0,
            version: None,
            manifest: None,
            list: None,
            downloader: None,
            last_progress: None,
            pending: None,
            events: vec![UpdateEvent::StepEntered(UpdateStep::RequestVersion)],
        }
    }

    pub fn step(&self) -> UpdateStep {
        self.step
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, FlowState::Finished(_))
    }

    pub fn outcome(&self) -> Option<&UpdateOutcome> {
        match &self.state {
            FlowState::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn remote_version(&self) -> Option<&VersionDocument> {
        self.version.as_ref()
    }

    pub fn download_list(&self) -> Option<&DownloadList> {
        self.list.as_ref()
    }

    /// Files and bytes still to download, once the list is known.
    pub fn download_summary(&self) -> Option<(usize, u64)> {
        self.list.as_ref().map(|l| (l.files(), l.bytes()))
    }

    pub fn progress(&self) -> Option<DownloadProgress> {
        self.downloader.as_ref().map(Downloader::progress)
    }

    pub fn drain_events(&mut self) -> Vec<UpdateEvent> {
        std::mem::take(&mut self.events)
    }

    /// Advance until the flow suspends, finishes, or waits on downloads.
    ///
    /// Returns true once the flow is finished.
    pub fn tick(&mut self, mut target: UpdateTarget<'_>) -> bool {
        while self.state == FlowState::Running {
            match self.run_step(&mut target) {
                Ok(Some(next)) => self.enter(next),
                Ok(None) => break,
                Err(failure) => self.fail(failure),
            }
        }
        self.is_finished()
    }

    /// Apply an operator decision to a suspended flow.
    pub fn signal(&mut self, signal: OperatorSignal) -> BundleResult<()> {
        let awaiting = matches!(
            self.state,
            FlowState::Suspended(Suspension::AwaitingConfirmation { .. })
        );
        let failed_step = match &self.state {
            FlowState::Suspended(Suspension::Failed(failure)) => Some(failure.step),
            _ => None,
        };

        match signal {
            _ if self.is_finished() => Err(self.rejected(signal)),
            OperatorSignal::Abort => {
                self.pending = None;
                if let Some(mut downloader) = self.downloader.take() {
                    downloader.cancel();
                }
                warn!(step = %self.step, "Update aborted by operator");
                self.finish(UpdateOutcome::Aborted);
                Ok(())
            }
            OperatorSignal::BeginDownload if awaiting => {
                self.state = FlowState::Running;
                self.enter(UpdateStep::DownloadFiles);
                Ok(())
            }
            OperatorSignal::RetryStep if failed_step.is_some() => {
                self.state = FlowState::Running;
                self.attempt += 1;
                debug!(step = %self.step, attempt = self.attempt, "Retrying update step");
                self.events.push(UpdateEvent::StepEntered(self.step));
                Ok(())
            }
            OperatorSignal::RewindToDownloadList
                if matches!(
                    failed_step,
                    Some(
                        UpdateStep::GetDownloadList
                            | UpdateStep::DownloadFiles
                            | UpdateStep::DownloadOver
                    )
                ) =>
            {
                self.state = FlowState::Running;
                self.enter(UpdateStep::GetDownloadList);
                Ok(())
            }
            _ => Err(self.rejected(signal)),
        }
    }

    fn rejected(&self, signal: OperatorSignal) -> BundleError {
        let state = match &self.state {
            FlowState::Running => format!("running at {}", self.step),
            FlowState::Suspended(Suspension::AwaitingConfirmation { .. }) => {
                "awaiting confirmation".to_string()
            }
            FlowState::Suspended(Suspension::Failed(failure)) => {
                format!("failed at {}", failure.step)
            }
            FlowState::Finished(_) => "finished".to_string(),
        };
        BundleError::InvalidSignal {
            signal: signal.to_string(),
            state,
        }
    }

    fn enter(&mut self, step: UpdateStep) {
        info!(from = %self.step, to = %step, "Update step");
        self.step = step;
        self.attempt = 0;
        self.pending = None;
        self.events.push(UpdateEvent::StepEntered(step));
    }

    fn suspend(&mut self, suspension: Suspension) {
        debug!(step = %self.step, ?suspension, "Update suspended");
        self.events.push(UpdateEvent::Suspended(suspension.clone()));
        self.state = FlowState::Suspended(suspension);
    }

    fn fail(&mut self, failure: UpdateFailure) {
        error!(
            step = %failure.step,
            operation = %failure.operation,
            resource = %failure.resource,
            error = %failure.message,
            "Update step failed"
        );
        self.events.push(UpdateEvent::StepFailed {
            step: failure.step,
            failure: failure.clone(),
        });
        self.suspend(Suspension::Failed(failure));
    }

    fn finish(&mut self, outcome: UpdateOutcome) {
        let terminal = match &outcome {
            UpdateOutcome::Updated { .. } | UpdateOutcome::UpToDate { .. } => {
                Some(UpdateStep::Done)
            }
            UpdateOutcome::MustReinstall { required, current } => {
                self.events.push(UpdateEvent::MustReinstall {
                    required: required.clone(),
                    current: current.clone(),
                });
                Some(UpdateStep::MustReinstall)
            }
            UpdateOutcome::Aborted => None,
        };
        if let Some(step) = terminal {
            self.enter(step);
        }
        info!(?outcome, "Update finished");
        self.events.push(UpdateEvent::Finished(outcome.clone()));
        self.state = FlowState::Finished(outcome);
    }

    /// Run the current step once. `Ok(None)` means stay.
    fn run_step(
        &mut self,
        target: &mut UpdateTarget<'_>,
    ) -> Result<Option<UpdateStep>, UpdateFailure> {
        match self.step {
            UpdateStep::RequestVersion => self.request_version(),
            UpdateStep::RequestManifest => self.request_manifest(target),
            UpdateStep::GetDownloadList => self.get_download_list(target),
            UpdateStep::DownloadFiles => self.download_files(target),
            UpdateStep::DownloadOver => self.download_over(target),
            UpdateStep::Done | UpdateStep::MustReinstall => Ok(None),
        }
    }

    /// Start fetching `url` or collect the answer of the fetch in progress.
    ///
    /// Returns `None` while the worker is still running.
    fn fetch_text(&mut self, url: &str) -> Option<BundleResult<String>> {
        let Some(pending) = self.pending.as_ref() else {
            let (tx, rx) = mpsc::channel();
            let transport = Arc::clone(&self.transport);
            let worker_url = url.to_string();
            thread::spawn(move || {
                // The flow may have moved on
                let _ = tx.send(transport.get_text(&worker_url));
            });
            debug!(url = %url, "Fetch started");
            self.pending = Some(PendingFetch {
                url: url.to_string(),
                rx,
            });
            return None;
        };

        let result = match pending.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(BundleError::Network {
                url: pending.url.clone(),
                reason: "fetch worker exited without a response".to_string(),
            }),
        };
        self.pending = None;
        Some(result)
    }

    fn request_version(&mut self) -> Result<Option<UpdateStep>, UpdateFailure> {
        let step = UpdateStep::RequestVersion;
        let url = self.remote.version_url(self.attempt);
        let Some(fetched) = self.fetch_text(&url) else {
            return Ok(None);
        };
        let text = fetched.map_err(|e| UpdateFailure::new(step, "fetch", &url, e.to_string()))?;
        let doc = VersionDocument::from_json(&text)
            .map_err(|e| UpdateFailure::new(step, "parse", &url, e.to_string()))?;

        let reinstall = doc
            .requires_reinstall(&self.app_version)
            .map_err(|e| UpdateFailure::new(step, "compare", &self.app_version, e.to_string()))?;
        if reinstall {
            warn!(
                required = %doc.min_app_version,
                current = %self.app_version,
                "Server requires a newer app build"
            );
            let outcome = UpdateOutcome::MustReinstall {
                required: doc.min_app_version.clone(),
                current: self.app_version.clone(),
            };
            self.version = Some(doc);
            self.finish(outcome);
            return Ok(None);
        }

        debug!(resource_version = doc.resource_version, "Remote version received");
        self.version = Some(doc);
        Ok(Some(UpdateStep::RequestManifest))
    }

    fn request_manifest(
        &mut self,
        target: &mut UpdateTarget<'_>,
    ) -> Result<Option<UpdateStep>, UpdateFailure> {
        let step = UpdateStep::RequestManifest;
        let Some(version) = self.version.as_ref().map(|v| v.resource_version) else {
            return Ok(Some(UpdateStep::RequestVersion));
        };

        if version == target.local.resource_version {
            info!(resource_version = version, "Resources already up to date");
            self.finish(UpdateOutcome::UpToDate {
                resource_version: version,
            });
            return Ok(None);
        }

        let url = self.remote.manifest_url(version, self.attempt);
        let Some(fetched) = self.fetch_text(&url) else {
            return Ok(None);
        };
        let text = fetched.map_err(|e| UpdateFailure::new(step, "fetch", &url, e.to_string()))?;
        let manifest = Manifest::from_json(&text, &url)
            .map_err(|e| UpdateFailure::new(step, "parse", &url, e.to_string()))?;
        if manifest.resource_version != version {
            return Err(UpdateFailure::new(
                step,
                "parse",
                &url,
                format!(
                    "manifest has resource version {} but the server announced {}",
                    manifest.resource_version, version
                ),
            ));
        }

        debug!(bundles = manifest.len(), "Remote manifest received");
        self.manifest = Some(manifest);
        Ok(Some(UpdateStep::GetDownloadList))
    }

    fn get_download_list(
        &mut self,
        target: &mut UpdateTarget<'_>,
    ) -> Result<Option<UpdateStep>, UpdateFailure> {
        let Some(manifest) = self.manifest.as_ref() else {
            return Ok(Some(UpdateStep::RequestManifest));
        };
        let list = download_list(
            manifest,
            target.builtin,
            target.cache,
            &self.scope,
            self.options.verify_level,
        )
        .map_err(|e| {
            UpdateFailure::new(UpdateStep::GetDownloadList, "diff", "cache", e.to_string())
        })?;

        if list.is_empty() {
            self.list = Some(list);
            return Ok(Some(UpdateStep::DownloadOver));
        }

        let suspension = Suspension::AwaitingConfirmation {
            files: list.files(),
            bytes: list.bytes(),
        };
        self.list = Some(list);
        self.suspend(suspension);
        Ok(None)
    }

    fn download_files(
        &mut self,
        target: &mut UpdateTarget<'_>,
    ) -> Result<Option<UpdateStep>, UpdateFailure> {
        if self.downloader.is_none() {
            let (Some(manifest), Some(list)) = (self.manifest.as_ref(), self.list.as_ref()) else {
                return Ok(Some(UpdateStep::GetDownloadList));
            };
            let entries: Vec<_> = list
                .entries()
                .iter()
                .filter(|e| !target.cache.contains(&e.content_hash))
                .cloned()
                .collect();
            let context = DownloadContext::new(
                self.transport.clone(),
                self.remote.clone(),
                manifest.resource_version,
                target.cache.layout().clone(),
            );
            self.downloader = Some(Downloader::submit(context, entries, self.options));
            self.last_progress = None;
        }

        let (done, progress) = match self.downloader.as_mut() {
            Some(downloader) => (downloader.poll(target.cache), downloader.progress()),
            None => return Ok(None),
        };
        if self.last_progress != Some(progress) {
            self.last_progress = Some(progress);
            self.events.push(UpdateEvent::DownloadProgress(progress));
        }
        if !done {
            return Ok(None);
        }

        let Some(mut downloader) = self.downloader.take() else {
            return Ok(None);
        };
        if downloader.status() == BatchStatus::Succeeded {
            return Ok(Some(UpdateStep::DownloadOver));
        }
        let (resource, message) = match downloader.take_last_error() {
            Some(err) => (failed_resource(&err), err.to_string()),
            None => ("batch".to_string(), format!("batch {:?}", downloader.status())),
        };
        Err(UpdateFailure::new(
            UpdateStep::DownloadFiles,
            "download",
            resource,
            message,
        ))
    }

    fn download_over(
        &mut self,
        target: &mut UpdateTarget<'_>,
    ) -> Result<Option<UpdateStep>, UpdateFailure> {
        let step = UpdateStep::DownloadOver;
        let Some(manifest) = self.manifest.as_ref() else {
            return Ok(Some(UpdateStep::RequestManifest));
        };

        let path = target.cache.layout().local_manifest();
        manifest.save(&path).map_err(|e| {
            UpdateFailure::new(step, "save", path.display().to_string(), e.to_string())
        })?;
        target
            .cache
            .flush()
            .map_err(|e| UpdateFailure::new(step, "flush", "cache index", e.to_string()))?;

        *target.local = manifest.clone();
        let outcome = UpdateOutcome::Updated {
            resource_version: manifest.resource_version,
            files: self.list.as_ref().map_or(0, DownloadList::files),
        };
        self.finish(outcome);
        Ok(None)
    }
}

/// The URL, path or bundle an error is about.
fn failed_resource(err: &BundleError) -> String {
    match err {
        BundleError::Network { url, .. } | BundleError::Timeout { url, .. } => url.clone(),
        BundleError::Integrity { bundle, .. } => bundle.clone(),
        BundleError::ReadFailed { path, .. }
        | BundleError::WriteFailed { path, .. }
        | BundleError::CreateDirFailed { path, .. } => path.display().to_string(),
        _ => "batch".to_string(),
    }
}
