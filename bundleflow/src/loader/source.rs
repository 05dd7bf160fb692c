//! Where a loader finds its bundle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cache::CacheStore;
use crate::error::{BundleError, BundleResult};
use crate::manifest::{Manifest, ManifestEntry};

/// Extension marking a scene asset in a simulated bundle directory.
pub const SIMULATED_SCENE_EXTENSION: &str = "scene";

/// Kind of loader backing a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderSource {
    /// Built-in, cached or remote bundle files.
    FileSystem { allow_remote: bool },
    /// Unpacked bundle directories under `root`, used during development.
    Simulated { root: PathBuf },
}

impl LoaderSource {
    /// Bundles resolve from the built-in root and cache only.
    pub fn offline() -> Self {
        Self::FileSystem {
            allow_remote: false,
        }
    }

    /// Bundles missing locally are downloaded on demand.
    pub fn host() -> Self {
        Self::FileSystem { allow_remote: true }
    }

    pub fn simulated(root: impl Into<PathBuf>) -> Self {
        Self::Simulated { root: root.into() }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, Self::Simulated { .. })
    }

    /// Resolve a bundle to the place its loader will read it from.
    pub fn locate(
        &self,
        entry: &ManifestEntry,
        builtin: &Manifest,
        cache: &CacheStore,
    ) -> Location {
        match self {
            Self::Simulated { root } => Location::Directory(root.join(&entry.name)),
            Self::FileSystem { allow_remote } => {
                let shipped = entry.flags.is_builtin
                    || builtin
                        .get(&entry.name)
                        .is_some_and(|b| b.content_hash == entry.content_hash);
                let builtin_path = cache.layout().builtin_file(&entry.content_hash);
                if shipped && builtin_path.is_file() {
                    return Location::Local(builtin_path);
                }
                if cache.contains(&entry.content_hash) {
                    return Location::Local(cache.cached_path(&entry.content_hash));
                }
                if *allow_remote {
                    Location::Remote
                } else {
                    Location::Unresolved
                }
            }
        }
    }
}

/// Resolved location of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A bundle file on disk.
    Local(PathBuf),
    /// Must be downloaded into the cache first.
    Remote,
    /// An unpacked bundle directory.
    Directory(PathBuf),
    /// No path could be resolved.
    Unresolved,
}

impl Location {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote)
    }
}

/// Files of an unpacked bundle directory, keyed by slash-separated relative
/// path.
pub(crate) fn list_directory(bundle: &str, dir: &Path) -> BundleResult<BTreeMap<String, PathBuf>> {
    if !dir.is_dir() {
        return Err(BundleError::UnknownBundle(bundle.to_string()));
    }

    let pattern = dir.join("**").join("*");
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern).map_err(|e| BundleError::InvalidContainer {
        bundle: bundle.to_string(),
        reason: e.to_string(),
    })?;

    let mut files = BTreeMap::new();
    for path in paths {
        let path = match path {
            Ok(p) => p,
            Err(e) => {
                warn!(bundle, error = %e, "Skipping unreadable simulated asset");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(dir) {
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(key, path);
        }
    }
    Ok(files)
}
