//! Persistent record of fully downloaded and verified bundles.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::layout::{StorageLayout, CACHE_INDEX_FILENAME};
use crate::error::{BundleError, BundleResult};
use crate::manifest::Manifest;

/// Content hashes known to be cached, stamped with the app build version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheRecord {
    pub app_version_stamp: String,
    pub cached_hashes: BTreeSet<String>,
}

/// Serialized form of the cache index.
#[derive(Debug, Serialize, Deserialize)]
struct CacheIndexFile {
    app_version: String,
    updated_at: DateTime<Utc>,
    hashes: BTreeSet<String>,
}

/// How the store was found when opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// No stamp existed; a fresh cache was created.
    Fresh,
    /// The existing cache matched the running build.
    Loaded { entries: usize },
    /// The cache was stamped by another build and has been cleared.
    ClearedDirty { previous: String },
}

/// Result of removing cached files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearResult {
    pub files_deleted: usize,
    pub bytes_freed: u64,
}

/// Counters for cache activity since the store was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Hashes currently recorded.
    pub entries: usize,
    /// Hashes newly inserted.
    pub insertions: u64,
    /// Index writes.
    pub flushes: u64,
}

/// Persisted set of cached content hashes.
///
/// The store is driven from the single polling loop; it is never mutated
/// from download worker threads.
#[derive(Debug)]
pub struct CacheStore {
    layout: StorageLayout,
    record: CacheRecord,
    stats: CacheStats,
}

impl CacheStore {
    /// Open the cache under `layout`, clearing it when stamped by a different
    /// app build.
    pub fn open(layout: StorageLayout, app_version: &str) -> BundleResult<(Self, OpenOutcome)> {
        let cache_dir = layout.cache_dir();
        fs::create_dir_all(&cache_dir).map_err(|e| BundleError::CreateDirFailed {
            path: cache_dir.clone(),
            source: e,
        })?;

        let stamp = read_optional(&layout.stamp_file())?.map(|s| s.trim().to_string());

        let mut store = Self {
            layout,
            record: CacheRecord {
                app_version_stamp: app_version.to_string(),
                cached_hashes: BTreeSet::new(),
            },
            stats: CacheStats::default(),
        };

        let outcome = match stamp {
            None => {
                store.remove_all_files()?;
                OpenOutcome::Fresh
            }
            Some(previous) if previous != app_version => {
                let cleared = store.remove_all_files()?;
                info!(
                    previous = %previous,
                    current = %app_version,
                    files = cleared.files_deleted,
                    "App build changed, cleared sandbox cache"
                );
                OpenOutcome::ClearedDirty { previous }
            }
            Some(_) => {
                let hashes = store.read_index(app_version)?;
                let entries = hashes.len();
                store.record.cached_hashes = hashes;
                OpenOutcome::Loaded { entries }
            }
        };

        store.write_stamp()?;
        store.flush()?;
        store.stats.entries = store.record.cached_hashes.len();
        debug!(?outcome, "Cache store opened");
        Ok((store, outcome))
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn record(&self) -> &CacheRecord {
        &self.record
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.record.cached_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record.cached_hashes.is_empty()
    }

    /// Check whether a content hash is recorded as cached.
    pub fn contains(&self, content_hash: &str) -> bool {
        self.record.cached_hashes.contains(content_hash)
    }

    /// Path of the cached file for a content hash.
    pub fn cached_path(&self, content_hash: &str) -> PathBuf {
        self.layout.cached_file(content_hash)
    }

    /// Record one verified hash and persist the index.
    ///
    /// Returns `true` if the hash was newly inserted.
    pub fn commit(&mut self, content_hash: &str) -> BundleResult<bool> {
        Ok(self.commit_batch([content_hash])? == 1)
    }

    /// Record a batch of verified hashes with a single index write.
    ///
    /// Returns the number of newly inserted hashes.
    pub fn commit_batch<I, S>(&mut self, hashes: I) -> BundleResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inserted = 0;
        for hash in hashes {
            if self.record.cached_hashes.insert(hash.as_ref().to_string()) {
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.stats.insertions += inserted as u64;
            self.stats.entries = self.record.cached_hashes.len();
            self.flush()?;
        }
        Ok(inserted)
    }

    /// Forget a hash and delete its file.
    pub fn remove(&mut self, content_hash: &str) -> BundleResult<bool> {
        let removed = self.record.cached_hashes.remove(content_hash);
        let path = self.layout.cached_file(content_hash);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| BundleError::WriteFailed {
                path: path.clone(),
                source: e,
            })?;
        }
        if removed {
            self.stats.entries = self.record.cached_hashes.len();
            self.flush()?;
        }
        Ok(removed)
    }

    /// Delete every cached file and forget all hashes.
    pub fn clear(&mut self) -> BundleResult<ClearResult> {
        let result = self.remove_all_files()?;
        self.stats.entries = 0;
        self.flush()?;
        Ok(result)
    }

    /// Delete cached files not referenced by any of `manifests`.
    ///
    /// Files the index never recorded, such as partial downloads left by a
    /// crash, are swept as well, so no download may be running.
    pub fn clear_unused(&mut self, manifests: &[&Manifest]) -> BundleResult<ClearResult> {
        let keep: BTreeSet<&str> = manifests
            .iter()
            .copied()
            .flat_map(|m| m.content_hashes())
            .collect();

        let dir = self.layout.cache_dir();
        let entries = fs::read_dir(&dir).map_err(|e| BundleError::ReadFailed {
            path: dir.clone(),
            source: e,
        })?;
        let mut result = ClearResult::default();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_file() || name == CACHE_INDEX_FILENAME || keep.contains(name) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path).map_err(|e| BundleError::WriteFailed {
                path: path.clone(),
                source: e,
            })?;
            debug!(file = name, size, "Removed unused cache file");
            result.files_deleted += 1;
            result.bytes_freed += size;
        }

        let recorded = self.record.cached_hashes.len();
        self.record.cached_hashes.retain(|h| keep.contains(h.as_str()));
        if self.record.cached_hashes.len() != recorded {
            self.stats.entries = self.record.cached_hashes.len();
            self.flush()?;
        }
        info!(
            files = result.files_deleted,
            bytes = result.bytes_freed,
            "Removed unused cache files"
        );
        Ok(result)
    }

    /// Write the index to disk (temp file then rename).
    pub fn flush(&mut self) -> BundleResult<()> {
        let index = CacheIndexFile {
            app_version: self.record.app_version_stamp.clone(),
            updated_at: Utc::now(),
            hashes: self.record.cached_hashes.clone(),
        };
        let content = serde_json::to_string(&index).map_err(|e| BundleError::WriteFailed {
            path: self.layout.cache_index(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

        let path = self.layout.cache_index();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| BundleError::WriteFailed {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| BundleError::WriteFailed {
            path: path.clone(),
            source: e,
        })?;
        self.stats.flushes += 1;
        Ok(())
    }

    fn write_stamp(&self) -> BundleResult<()> {
        let path = self.layout.stamp_file();
        fs::write(&path, &self.record.app_version_stamp)
            .map_err(|e| BundleError::WriteFailed { path, source: e })
    }

    /// Read the index, dropping hashes whose file has vanished.
    fn read_index(&self, app_version: &str) -> BundleResult<BTreeSet<String>> {
        let path = self.layout.cache_index();
        let Some(content) = read_optional(&path)? else {
            return Ok(BTreeSet::new());
        };

        let index: CacheIndexFile = match serde_json::from_str(&content) {
            Ok(index) => index,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache index, starting empty");
                return Ok(BTreeSet::new());
            }
        };

        if index.app_version != app_version {
            warn!(
                index_version = %index.app_version,
                "Cache index stamped by another build, ignoring it"
            );
            return Ok(BTreeSet::new());
        }

        Ok(index
            .hashes
            .into_iter()
            .filter(|h| self.layout.cached_file(h).is_file())
            .collect())
    }

    /// Remove every file in the cache directory, keeping the directory.
    fn remove_all_files(&mut self) -> BundleResult<ClearResult> {
        let dir = self.layout.cache_dir();
        let mut result = ClearResult::default();
        let entries = fs::read_dir(&dir).map_err(|e| BundleError::ReadFailed {
            path: dir.clone(),
            source: e,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.file_name().is_some_and(|n| n == CACHE_INDEX_FILENAME) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path).map_err(|e| BundleError::WriteFailed {
                path: path.clone(),
                source: e,
            })?;
            result.files_deleted += 1;
            result.bytes_freed += size;
        }

        self.record.cached_hashes.clear();
        Ok(result)
    }
}

fn read_optional(path: &Path) -> BundleResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BundleError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use tempfile::TempDir;

    fn layout(temp: &TempDir) -> StorageLayout {
        StorageLayout::new(temp.path().join("builtin"), temp.path().join("sandbox"))
    }

    fn put_file(layout: &StorageLayout, hash: &str) {
        fs::write(layout.cached_file(hash), b"data").unwrap();
    }

    #[test]
    fn test_first_open_is_fresh() {
        let temp = TempDir::new().unwrap();
        let (store, outcome) = CacheStore::open(layout(&temp), "1.0").unwrap();

        assert_eq!(outcome, OpenOutcome::Fresh);
        assert!(store.is_empty());
        let stamp = fs::read_to_string(layout(&temp).stamp_file()).unwrap();
        assert_eq!(stamp, "1.0");
    }

    #[test]
    fn test_reopen_same_build_keeps_hashes() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = CacheStore::open(layout(&temp), "1.0").unwrap();
        put_file(store.layout(), "h1");
        store.commit("h1").unwrap();
        drop(store);

        let (store, outcome) = CacheStore::open(layout(&temp), "1.0").unwrap();
        assert_eq!(outcome, OpenOutcome::Loaded { entries: 1 });
        assert!(store.contains("h1"));
    }

    #[test]
    fn test_dirty_cache_is_cleared_and_restamped() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = CacheStore::open(layout(&temp), "1.0").unwrap();
        put_file(store.layout(), "h1");
        put_file(store.layout(), "h2");
        store.commit_batch(["h1", "h2"]).unwrap();
        drop(store);

        let (store, outcome) = CacheStore::open(layout(&temp), "1.1").unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::ClearedDirty {
                previous: "1.0".to_string()
            }
        );
        assert!(store.is_empty());
        assert_eq!(store.record().app_version_stamp, "1.1");
        assert!(!store.layout().cached_file("h1").exists());
        let stamp = fs::read_to_string(store.layout().stamp_file()).unwrap();
        assert_eq!(stamp, "1.1");
    }

    #[test]
    fn test_missing_files_dropped_on_load() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = CacheStore::open(layout(&temp), "1.0").unwrap();
        put_file(store.layout(), "h1");
        store.commit_batch(["h1", "ghost"]).unwrap();
        drop(store);

        let (store, _) = CacheStore::open(layout(&temp), "1.0").unwrap();
        assert!(store.contains("h1"));
        assert!(!store.contains("ghost"));
    }

    #[test]
    fn test_commit_batch_flushes_once() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = CacheStore::open(layout(&temp), "1.0").unwrap();
        let before = store.stats().flushes;

        let inserted = store.commit_batch(["a", "b", "c", "a"]).unwrap();

        assert_eq!(inserted, 3);
        assert_eq!(store.stats().flushes, before + 1);
        assert_eq!(store.stats().insertions, 3);
        assert!(!store.commit("a").unwrap());
    }

    #[test]
    fn test_clear_unused() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = CacheStore::open(layout(&temp), "1.0").unwrap();
        put_file(store.layout(), "keep");
        put_file(store.layout(), "drop");
        store.commit_batch(["keep", "drop"]).unwrap();

        let manifest = Manifest::new(1, vec![ManifestEntry::new("a", "keep", "0", 4, 1)]).unwrap();
        let result = store.clear_unused(&[&manifest]).unwrap();

        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.bytes_freed, 4);
        assert!(store.contains("keep"));
        assert!(!store.contains("drop"));
    }

    #[test]
    fn test_clear_unused_sweeps_untracked_files() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = CacheStore::open(layout(&temp), "1.0").unwrap();
        put_file(store.layout(), "keep");
        store.commit("keep").unwrap();
        put_file(store.layout(), "stray");
        let partial = store.layout().partial_file("keep", "b1a0");
        fs::write(&partial, b"pa").unwrap();

        let manifest = Manifest::new(1, vec![ManifestEntry::new("a", "keep", "0", 4, 1)]).unwrap();
        let result = store.clear_unused(&[&manifest]).unwrap();

        assert_eq!(result.files_deleted, 2);
        assert_eq!(result.bytes_freed, 6);
        assert!(!store.layout().cached_file("stray").exists());
        assert!(!partial.exists());
        assert!(store.layout().cached_file("keep").exists());
        assert!(store.layout().cache_index().exists());
        assert!(store.contains("keep"));
    }

    #[test]
    fn test_clear_removes_everything() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = CacheStore::open(layout(&temp), "1.0").unwrap();
        put_file(store.layout(), "h1");
        store.commit("h1").unwrap();

        let result = store.clear().unwrap();

        assert_eq!(result.files_deleted, 1);
        assert!(store.is_empty());
        assert!(store.layout().cache_index().exists());
    }
}
