//! `bundleflow update`: bring local bundles up to the server's version.
//!
//! Drives the engine's update flow from the terminal. The flow suspends
//! twice for operator input: before downloading, and whenever a step fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bundleflow::update::{
    FlowState, OperatorSignal, Suspension, UpdateEvent, UpdateFailure, UpdateOutcome, UpdateStep,
};
use bundleflow::BundleSystem;
use console::style;
use dialoguer::{Confirm, Select};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use super::common::{format_size, scope_from_tags};
use crate::error::CliError;
use crate::runner::CliRunner;

/// Delay between engine ticks.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

pub struct UpdateArgs {
    /// Answer every prompt without asking.
    pub yes: bool,
    pub tags: Vec<String>,
}

/// What to do after a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Retry,
    Rewind,
    Abort,
}

impl Recovery {
    fn label(&self) -> &'static str {
        match self {
            Self::Retry => "Retry the failed step",
            Self::Rewind => "Recompute the download list and start over",
            Self::Abort => "Abort the update",
        }
    }

    fn signal(&self) -> OperatorSignal {
        match self {
            Self::Retry => OperatorSignal::RetryStep,
            Self::Rewind => OperatorSignal::RewindToDownloadList,
            Self::Abort => OperatorSignal::Abort,
        }
    }
}

/// Choices offered for a failure in `step`.
fn recovery_options(step: UpdateStep) -> Vec<Recovery> {
    match step {
        UpdateStep::GetDownloadList | UpdateStep::DownloadFiles | UpdateStep::DownloadOver => {
            vec![Recovery::Retry, Recovery::Rewind, Recovery::Abort]
        }
        _ => vec![Recovery::Retry, Recovery::Abort],
    }
}

pub fn run(runner: &CliRunner, args: UpdateArgs) -> Result<(), CliError> {
    let mut system = runner.system()?;
    let scope = scope_from_tags(args.tags);

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::SeqCst);
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    println!(
        "Checking for updates (local resource version {})",
        system.local_manifest().resource_version
    );
    info!(scope = %scope, "Starting update");
    system.begin_update(scope)?;

    let mut bar: Option<ProgressBar> = None;
    let mut abort_sent = false;

    loop {
        if interrupted.load(Ordering::SeqCst) && !abort_sent {
            abort_sent = true;
            println!();
            println!("Interrupted, aborting update...");
            system.submit_operator_signal(OperatorSignal::Abort)?;
        }

        system.tick();
        for event in system.drain_events() {
            handle_event(&event, &mut bar);
        }

        let suspension = match system.update_state() {
            Some(FlowState::Suspended(suspension)) => suspension.clone(),
            Some(FlowState::Finished(outcome)) => {
                let outcome = outcome.clone();
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
                return finish(&system, outcome);
            }
            _ => {
                thread::sleep(TICK_INTERVAL);
                continue;
            }
        };

        if abort_sent {
            thread::sleep(TICK_INTERVAL);
            continue;
        }
        let signal = match suspension {
            Suspension::AwaitingConfirmation { files, bytes } => {
                confirm_download(files, bytes, args.yes)?
            }
            Suspension::Failed(failure) => {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
                choose_recovery(&failure, args.yes)?
            }
        };
        debug!(signal = %signal, "Operator signal");
        system.submit_operator_signal(signal)?;
    }
}

fn handle_event(event: &UpdateEvent, bar: &mut Option<ProgressBar>) {
    match event {
        UpdateEvent::StepEntered(step) => debug!(step = step.name(), "Update step"),
        UpdateEvent::DownloadProgress(progress) => {
            let bar = bar.get_or_insert_with(|| new_bar(progress.bytes_total));
            bar.set_length(progress.bytes_total);
            bar.set_position(progress.bytes_done);
            bar.set_message(format!(
                "{}/{} files",
                progress.files_done, progress.files_total
            ));
        }
        UpdateEvent::StepFailed { failure, .. } => {
            eprintln!("{} {}", style("warning:").yellow().bold(), failure);
        }
        UpdateEvent::MustReinstall { required, current } => {
            info!(required = %required, current = %current, "Server requires a newer build");
        }
        UpdateEvent::Suspended(_) | UpdateEvent::Finished(_) => {}
    }
}

fn new_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    let bar_style = ProgressStyle::default_bar()
        .template("[{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    bar.set_style(bar_style);
    bar
}

fn confirm_download(files: usize, bytes: u64, yes: bool) -> Result<OperatorSignal, CliError> {
    if files == 0 {
        return Ok(OperatorSignal::BeginDownload);
    }
    println!("{} bundles to download ({})", files, format_size(bytes));
    if yes {
        return Ok(OperatorSignal::BeginDownload);
    }

    let proceed = Confirm::new()
        .with_prompt("Download now?")
        .default(true)
        .interact()?;
    Ok(if proceed {
        OperatorSignal::BeginDownload
    } else {
        OperatorSignal::Abort
    })
}

fn choose_recovery(failure: &UpdateFailure, yes: bool) -> Result<OperatorSignal, CliError> {
    // Nobody to ask; stop rather than retry forever.
    if yes {
        return Err(CliError::UpdateFailed(failure.clone()));
    }

    let options = recovery_options(failure.step);
    let labels: Vec<&str> = options.iter().map(Recovery::label).collect();
    let choice = Select::new()
        .with_prompt(format!("{} failed", failure.step))
        .items(&labels)
        .default(0)
        .interact()?;

    match options.get(choice) {
        Some(Recovery::Abort) | None => Err(CliError::UpdateFailed(failure.clone())),
        Some(recovery) => Ok(recovery.signal()),
    }
}

fn finish(system: &BundleSystem, outcome: UpdateOutcome) -> Result<(), CliError> {
    match outcome {
        UpdateOutcome::Updated {
            resource_version,
            files,
        } => {
            println!(
                "{} Updated to resource version {} ({} bundles downloaded)",
                style("✓").green(),
                resource_version,
                files
            );
            let stats = system.cache_stats();
            debug!(cached = stats.entries, flushes = stats.flushes, "Cache after update");
            Ok(())
        }
        UpdateOutcome::UpToDate { resource_version } => {
            println!("Already up to date (resource version {})", resource_version);
            Ok(())
        }
        UpdateOutcome::MustReinstall { required, current } => {
            Err(CliError::MustReinstall { required, current })
        }
        UpdateOutcome::Aborted => Err(CliError::Aborted),
    }
}
