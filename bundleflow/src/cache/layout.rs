//! On-disk layout of the built-in and sandbox roots.

use std::path::{Path, PathBuf};

/// File name of a manifest document in either root.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Directory under the sandbox holding cached bundle files.
pub const CACHE_DIRNAME: &str = "cache";

/// Persisted set of cached content hashes.
pub const CACHE_INDEX_FILENAME: &str = "cache_index.json";

/// Stamp file recording the last-seen app build version.
pub const STAMP_FILENAME: &str = "app_version.stamp";

/// Suffix for in-progress downloads.
pub const PARTIAL_SUFFIX: &str = "part";

/// Paths for the read-only built-in root and the writable sandbox root.
///
/// ```text
/// <builtin>/manifest.json
/// <builtin>/<content_hash>
/// <sandbox>/manifest.json
/// <sandbox>/app_version.stamp
/// <sandbox>/cache/cache_index.json
/// <sandbox>/cache/<content_hash>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    builtin_root: PathBuf,
    sandbox_root: PathBuf,
}

impl StorageLayout {
    pub fn new(builtin_root: impl Into<PathBuf>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            builtin_root: builtin_root.into(),
            sandbox_root: sandbox_root.into(),
        }
    }

    pub fn builtin_root(&self) -> &Path {
        &self.builtin_root
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    /// App-bundled manifest.
    pub fn builtin_manifest(&self) -> PathBuf {
        self.builtin_root.join(MANIFEST_FILENAME)
    }

    /// Built-in copy of a bundle.
    pub fn builtin_file(&self, content_hash: &str) -> PathBuf {
        self.builtin_root.join(content_hash)
    }

    /// Persisted local manifest.
    pub fn local_manifest(&self) -> PathBuf {
        self.sandbox_root.join(MANIFEST_FILENAME)
    }

    pub fn stamp_file(&self) -> PathBuf {
        self.sandbox_root.join(STAMP_FILENAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.sandbox_root.join(CACHE_DIRNAME)
    }

    pub fn cache_index(&self) -> PathBuf {
        self.cache_dir().join(CACHE_INDEX_FILENAME)
    }

    /// Cached copy of a bundle.
    pub fn cached_file(&self, content_hash: &str) -> PathBuf {
        self.cache_dir().join(content_hash)
    }

    /// Temporary file for one download attempt.
    ///
    /// `tag` identifies the batch and attempt so an abandoned transfer never
    /// writes into the file of its successor.
    pub fn partial_file(&self, content_hash: &str, tag: &str) -> PathBuf {
        self.cache_dir()
            .join(format!("{}.{}.{}", content_hash, tag, PARTIAL_SUFFIX))
    }
}
