//! `bundleflow diff`: preview what an update would download.
//!
//! Without `--manifest` the remote version and manifest are fetched and the
//! update is aborted once the download list is known. With `--manifest` the
//! given file is diffed locally and nothing is fetched.

use std::path::Path;
use std::thread;
use std::time::Duration;

use bundleflow::diff::{candidates, DownloadScope};
use bundleflow::manifest::{Manifest, ManifestEntry};
use bundleflow::update::{FlowState, OperatorSignal, Suspension, UpdateOutcome};
use bundleflow::BundleSystem;

use super::common::{format_size, print_entries, scope_from_tags};
use crate::error::CliError;
use crate::runner::CliRunner;

const TICK_INTERVAL: Duration = Duration::from_millis(10);

pub fn run(
    runner: &CliRunner,
    manifest: Option<&Path>,
    tags: Vec<String>,
) -> Result<(), CliError> {
    let mut system = runner.system()?;
    let scope = scope_from_tags(tags);

    let entries = match manifest {
        Some(path) => local_diff(&system, path, &scope)?,
        None => match remote_diff(&mut system, scope)? {
            Some(entries) => entries,
            None => return Ok(()),
        },
    };

    if entries.is_empty() {
        println!("Nothing to download");
        return Ok(());
    }
    let bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
    println!("{} bundles to download ({}):", entries.len(), format_size(bytes));
    print_entries(&entries);
    Ok(())
}

fn local_diff(
    system: &BundleSystem,
    path: &Path,
    scope: &DownloadScope,
) -> Result<Vec<ManifestEntry>, CliError> {
    let remote = Manifest::load(path).map_err(|e| CliError::InvalidManifest(e.to_string()))?;
    println!(
        "Resource version {} -> {}",
        system.local_manifest().resource_version,
        remote.resource_version
    );
    Ok(candidates(
        &remote,
        system.builtin_manifest(),
        system.cache(),
        scope,
    ))
}

/// Run the update flow up to its confirmation prompt.
///
/// Returns `None` when the local resources already match the server. An
/// empty download list completes the update immediately.
fn remote_diff(
    system: &mut BundleSystem,
    scope: DownloadScope,
) -> Result<Option<Vec<ManifestEntry>>, CliError> {
    system.begin_update(scope)?;
    loop {
        system.tick();
        match system.update_state() {
            Some(FlowState::Suspended(Suspension::AwaitingConfirmation { .. })) => break,
            Some(FlowState::Suspended(Suspension::Failed(failure))) => {
                return Err(CliError::UpdateFailed(failure.clone()));
            }
            Some(FlowState::Finished(UpdateOutcome::UpToDate { resource_version })) => {
                println!("Already up to date (resource version {})", resource_version);
                return Ok(None);
            }
            Some(FlowState::Finished(UpdateOutcome::MustReinstall { required, current })) => {
                return Err(CliError::MustReinstall {
                    required: required.clone(),
                    current: current.clone(),
                });
            }
            // Every remote bundle was already present; the flow adopted the
            // remote manifest without downloading.
            Some(FlowState::Finished(UpdateOutcome::Updated {
                resource_version, ..
            })) => {
                println!("Local resources now at version {}", resource_version);
                return Ok(Some(Vec::new()));
            }
            Some(FlowState::Finished(UpdateOutcome::Aborted)) => return Err(CliError::Aborted),
            _ => thread::sleep(TICK_INTERVAL),
        }
    }

    let entries = system
        .update()
        .and_then(|flow| flow.download_list())
        .map(|list| list.entries().to_vec())
        .unwrap_or_default();
    if let Some(version) = system.update().and_then(|flow| flow.remote_version()) {
        println!(
            "Resource version {} -> {}",
            system.local_manifest().resource_version,
            version.resource_version
        );
    }
    system.submit_operator_signal(OperatorSignal::Abort)?;
    Ok(Some(entries))
}
