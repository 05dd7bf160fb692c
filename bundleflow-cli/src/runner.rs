//! Shared command setup: configuration and logging.

use std::path::{Path, PathBuf};

use bundleflow::logging::{init_logging, LogConfig, WorkerGuard};
use bundleflow::{BundleSystem, Settings};
use tracing::info;

use crate::error::CliError;

/// Loaded configuration plus the logging guard for the command's lifetime.
pub struct CliRunner {
    settings: Settings,
    config_path: PathBuf,
    _log_guard: Option<WorkerGuard>,
}

impl CliRunner {
    /// Load settings from `config` (or the default path) and start logging.
    pub fn new(config: Option<&Path>, verbose: bool) -> Result<Self, CliError> {
        let config_path = match config {
            Some(path) => path.to_path_buf(),
            None => Settings::default_path()?,
        };
        let settings = Settings::load_or_default(&config_path)?;

        let mut log_config = LogConfig::from(&settings);
        if verbose {
            log_config = log_config.with_level("debug");
        }
        let guard = init_logging(&log_config)?;

        Ok(Self {
            settings,
            config_path,
            _log_guard: guard,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            command,
            version = env!("CARGO_PKG_VERSION"),
            config = %self.config_path.display(),
            "bundleflow starting"
        );
    }

    /// Initialize the engine over HTTP.
    pub fn system(&self) -> Result<BundleSystem, CliError> {
        Ok(BundleSystem::initialize(self.settings.clone())?)
    }
}
