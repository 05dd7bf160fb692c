//! Manifest model.
//!
//! A manifest is the authoritative list of bundles known to a build: their
//! content hashes, checksums, sizes, versions and dependency edges. Three
//! manifests coexist at runtime:
//!
//! - **app-bundled**: shipped in the read-only built-in root
//! - **local**: persisted in the sandbox after a successful update
//! - **remote**: fetched during an update; replaces local on success
//!
//! Every manifest is validated when constructed or parsed: duplicate names
//! and dangling dependency names are [`ManifestInconsistency`] errors and
//! cycles are [`DependencyCycle`] errors.
//!
//! [`ManifestInconsistency`]: crate::error::BundleError::ManifestInconsistency
//! [`DependencyCycle`]: crate::error::BundleError::DependencyCycle

mod document;
mod entry;

pub use document::{variant_name, Manifest, VariantGroup};
pub use entry::{EntryFlags, ManifestEntry};
