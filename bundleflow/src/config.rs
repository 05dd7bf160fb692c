//! Engine configuration.
//!
//! Settings are read from an INI file:
//!
//! ```ini
//! [storage]
//! builtin_root = /opt/game/data
//! sandbox_root = ~/.local/share/bundleflow
//!
//! [remote]
//! primary_url = https://cdn-a.example.com/bundles
//! fallback_url = https://cdn-b.example.com/bundles
//!
//! [download]
//! max_concurrent = 4
//! verify_level = high
//!
//! [loader]
//! mode = host
//! ```
//!
//! Missing keys keep their defaults and unknown keys are ignored.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::cache::StorageLayout;
use crate::download::{
    DownloadOptions, RemoteServices, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RETRIES,
    DEFAULT_STALL_TIMEOUT, DEFAULT_TIMEOUT_SECS,
};
use crate::loader::{DecryptionMode, LoaderSource, DEFAULT_WAIT_CEILING};
use crate::verify::VerifyLevel;

/// Name of the configuration directory and file.
pub const CONFIG_DIRNAME: &str = "bundleflow";
pub const CONFIG_FILENAME: &str = "config.ini";

/// Default manifest file name on the remote host.
pub const DEFAULT_MANIFEST_FILE: &str = "manifest.json";

/// Errors loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value '{value}' for {section}.{key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}

/// How bundles are sourced at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlayMode {
    /// Built-in and cached bundles only.
    Offline,
    /// Missing bundles are downloaded from the remote host.
    #[default]
    Host,
    /// Unpacked bundle directories under the simulation root.
    Simulated,
}

impl fmt::Display for PlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Host => write!(f, "host"),
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

impl FromStr for PlayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offline" => Ok(Self::Offline),
            "host" | "online" => Ok(Self::Host),
            "simulated" | "simulate" => Ok(Self::Simulated),
            other => Err(format!("unknown play mode '{}'", other)),
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Read-only root shipped with the app.
    pub builtin_root: PathBuf,
    /// Writable root for the local manifest and cache.
    pub sandbox_root: PathBuf,
    /// Root of unpacked bundle directories in simulated mode.
    pub simulation_root: PathBuf,

    pub primary_url: String,
    /// Defaults to the primary URL.
    pub fallback_url: Option<String>,
    pub manifest_file: String,
    pub timeout: Duration,

    pub max_concurrent_downloads: usize,
    pub max_retries: u32,
    pub stall_timeout: Duration,
    pub verify_level: VerifyLevel,

    pub play_mode: PlayMode,
    /// Decryption strategy key; `None` disables decryption.
    pub decryption: Option<String>,
    pub decryption_mode: DecryptionMode,
    /// Preferred bundle variant.
    pub variant: Option<String>,
    pub wait_ceiling: u64,

    /// Build version stamped on the sandbox cache.
    pub app_version: String,

    pub log_level: String,
    /// Directory for rolling log files; `None` logs to stderr only.
    pub log_directory: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let sandbox_root = dirs::data_local_dir()
            .map(|d| d.join(CONFIG_DIRNAME))
            .unwrap_or_else(|| PathBuf::from("sandbox"));
        Self {
            builtin_root: PathBuf::from("data"),
            sandbox_root,
            simulation_root: PathBuf::from("bundles"),
            primary_url: "http://127.0.0.1:8000".to_string(),
            fallback_url: None,
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT,
            max_retries: DEFAULT_MAX_RETRIES,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            verify_level: VerifyLevel::default(),
            play_mode: PlayMode::default(),
            decryption: None,
            decryption_mode: DecryptionMode::default(),
            variant: None,
            wait_ceiling: DEFAULT_WAIT_CEILING,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            log_directory: None,
        }
    }
}

impl Settings {
    /// Settings with the given storage roots.
    pub fn new(builtin_root: impl Into<PathBuf>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            builtin_root: builtin_root.into(),
            sandbox_root: sandbox_root.into(),
            ..Default::default()
        }
    }

    pub fn with_remote(mut self, primary: impl Into<String>, fallback: Option<String>) -> Self {
        self.primary_url = primary.into();
        self.fallback_url = fallback;
        self
    }

    pub fn with_play_mode(mut self, mode: PlayMode) -> Self {
        self.play_mode = mode;
        self
    }

    pub fn with_simulation_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.simulation_root = root.into();
        self
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    /// Set the maximum concurrent downloads (minimum 1).
    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max.max(1);
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

    pub fn with_decryption(mut self, key: impl Into<String>, mode: DecryptionMode) -> Self {
        self.decryption = Some(key.into());
        self.decryption_mode = mode;
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_wait_ceiling(mut self, ceiling: u64) -> Self {
        self.wait_ceiling = ceiling.max(1);
        self
    }

    /// Default config file location (`<config dir>/bundleflow/config.ini`).
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|d| d.join(CONFIG_DIRNAME).join(CONFIG_FILENAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load settings from an INI file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Load settings, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse settings from INI text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(content).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut s = Self::default();
        let get = |section: &str, key: &str| {
            ini.get_from(Some(section), key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("storage", "builtin_root") {
            s.builtin_root = PathBuf::from(v);
        }
        if let Some(v) = get("storage", "sandbox_root") {
            s.sandbox_root = PathBuf::from(v);
        }
        if let Some(v) = get("storage", "simulation_root") {
            s.simulation_root = PathBuf::from(v);
        }

        if let Some(v) = get("remote", "primary_url") {
            s.primary_url = v.to_string();
        }
        if let Some(v) = get("remote", "fallback_url") {
            s.fallback_url = Some(v.to_string());
        }
        if let Some(v) = get("remote", "manifest_file") {
            s.manifest_file = v.to_string();
        }
        if let Some(v) = get("remote", "timeout_secs") {
            s.timeout = parse_secs("remote", "timeout_secs", v)?;
        }

        if let Some(v) = get("download", "max_concurrent") {
            let max: usize = parse_value("download", "max_concurrent", v)?;
            if max == 0 {
                return Err(invalid("download", "max_concurrent", v));
            }
            s.max_concurrent_downloads = max;
        }
        if let Some(v) = get("download", "max_retries") {
            s.max_retries = parse_value("download", "max_retries", v)?;
        }
        if let Some(v) = get("download", "stall_timeout_secs") {
            s.stall_timeout = parse_secs("download", "stall_timeout_secs", v)?;
        }
        if let Some(v) = get("download", "verify_level") {
            s.verify_level = parse_value("download", "verify_level", v)?;
        }

        if let Some(v) = get("loader", "mode") {
            s.play_mode = parse_value("loader", "mode", v)?;
        }
        if let Some(v) = get("loader", "decryption") {
            s.decryption = Some(v.to_string());
        }
        if let Some(v) = get("loader", "decryption_mode") {
            s.decryption_mode = parse_value("loader", "decryption_mode", v)?;
        }
        if let Some(v) = get("loader", "variant") {
            s.variant = Some(v.to_string());
        }
        if let Some(v) = get("loader", "wait_ceiling") {
            let ceiling: u64 = parse_value("loader", "wait_ceiling", v)?;
            if ceiling == 0 {
                return Err(invalid("loader", "wait_ceiling", v));
            }
            s.wait_ceiling = ceiling;
        }

        if let Some(v) = get("app", "version") {
            s.app_version = v.to_string();
        }

        if let Some(v) = get("logging", "level") {
            s.log_level = v.to_string();
        }
        if let Some(v) = get("logging", "directory") {
            s.log_directory = Some(PathBuf::from(v));
        }

        Ok(s)
    }

    /// All settings as `(section.key, value)` pairs, in file order.
    pub fn entries(&self) -> Vec<(String, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let path = |p: &Path| p.display().to_string();
        vec![
            ("storage.builtin_root".into(), path(&self.builtin_root)),
            ("storage.sandbox_root".into(), path(&self.sandbox_root)),
            ("storage.simulation_root".into(), path(&self.simulation_root)),
            ("remote.primary_url".into(), self.primary_url.clone()),
            ("remote.fallback_url".into(), opt(&self.fallback_url)),
            ("remote.manifest_file".into(), self.manifest_file.clone()),
            ("remote.timeout_secs".into(), self.timeout.as_secs().to_string()),
            (
                "download.max_concurrent".into(),
                self.max_concurrent_downloads.to_string(),
            ),
            ("download.max_retries".into(), self.max_retries.to_string()),
            (
                "download.stall_timeout_secs".into(),
                self.stall_timeout.as_secs().to_string(),
            ),
            ("download.verify_level".into(), self.verify_level.to_string()),
            ("loader.mode".into(), self.play_mode.to_string()),
            ("loader.decryption".into(), opt(&self.decryption)),
            ("loader.decryption_mode".into(), self.decryption_mode.to_string()),
            ("loader.variant".into(), opt(&self.variant)),
            ("loader.wait_ceiling".into(), self.wait_ceiling.to_string()),
            ("app.version".into(), self.app_version.clone()),
            ("logging.level".into(), self.log_level.clone()),
            (
                "logging.directory".into(),
                self.log_directory
                    .as_deref()
                    .map(path)
                    .unwrap_or_default(),
            ),
        ]
    }

    /// Write every non-empty setting to an INI file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        for (name, value) in self.entries() {
            if value.is_empty() {
                continue;
            }
            if let Some((section, key)) = name.split_once('.') {
                ini.with_section(Some(section)).set(key, value);
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        ini.write_to_file(path).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.builtin_root, &self.sandbox_root)
    }

    pub fn remote(&self) -> RemoteServices {
        let fallback = self
            .fallback_url
            .clone()
            .unwrap_or_else(|| self.primary_url.clone());
        RemoteServices::new(self.primary_url.clone(), fallback, self.manifest_file.clone())
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions::default()
            .with_max_concurrent(self.max_concurrent_downloads)
            .with_max_retries(self.max_retries)
            .with_stall_timeout(self.stall_timeout)
            .with_verify_level(self.verify_level)
    }

    pub fn loader_source(&self) -> LoaderSource {
        match self.play_mode {
            PlayMode::Offline => LoaderSource::offline(),
            PlayMode::Host => LoaderSource::host(),
            PlayMode::Simulated => LoaderSource::simulated(&self.simulation_root),
        }
    }
}

fn invalid(section: &str, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_value<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(section, key, value))
}

/// A positive number of seconds.
fn parse_secs(section: &str, key: &str, value: &str) -> Result<Duration, ConfigError> {
    match parse_value::<u64>(section, key, value)? {
        0 => Err(invalid(section, key, value)),
        secs => Ok(Duration::from_secs(secs)),
    }
}
