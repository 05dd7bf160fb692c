//! bundleflow - versioned bundle distribution and loading
//!
//! This library keeps a local cache of content-addressed bundles in sync with
//! a remote manifest and loads bundles on demand with dependency awareness.
//!
//! - [`manifest`] - bundle entries, dependency edges and variants
//! - [`verify`] - size, SHA-256 and CRC-32 checks
//! - [`cache`] - sandbox cache stamped with the app build version
//! - [`diff`] - which remote bundles need downloading
//! - [`download`] - bounded download pool with retry and host fallback
//! - [`loader`] - reference-counted bundle loaders and asset providers
//! - [`update`] - the step-by-step update flow
//! - [`system`] - [`BundleSystem`], the context a host drives once per tick

pub mod cache;
pub mod config;
pub mod diff;
pub mod download;
pub mod error;
pub mod loader;
pub mod logging;
pub mod manifest;
pub mod system;
pub mod update;
pub mod verify;

pub use config::{ConfigError, PlayMode, Settings};
pub use error::{BundleError, BundleResult, IntegrityKind};
pub use system::{BundleSystem, SystemBuilder};
