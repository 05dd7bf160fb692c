//! Manifest diffing.
//!
//! Computes which remote bundles must be downloaded given what the app ships
//! and what the sandbox cache already holds.

use std::fmt;

use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::error::BundleResult;
use crate::manifest::{Manifest, ManifestEntry};
use crate::verify::{is_valid, VerifyLevel};

/// Which remote entries a download should cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DownloadScope {
    /// Every entry.
    #[default]
    All,
    /// Untagged entries plus entries carrying any of these tags.
    Tags(Vec<String>),
}

impl DownloadScope {
    pub fn includes(&self, entry: &ManifestEntry) -> bool {
        match self {
            Self::All => true,
            Self::Tags(tags) => entry.is_untagged() || entry.has_any_tag(tags),
        }
    }
}

impl fmt::Display for DownloadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Tags(tags) => write!(f, "tags[{}]", tags.join(",")),
        }
    }
}

/// Ordered list of entries to download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadList {
    entries: Vec<ManifestEntry>,
}

impl DownloadList {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ManifestEntry> {
        self.entries
    }

    pub fn files(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Remote entries that are neither cached nor shipped with the app, in
/// remote manifest order.
///
/// Does not touch the file system.
pub fn candidates(
    remote: &Manifest,
    builtin: &Manifest,
    cache: &CacheStore,
    scope: &DownloadScope,
) -> Vec<ManifestEntry> {
    remote
        .iter()
        .filter(|entry| !cache.contains(&entry.content_hash))
        .filter(|entry| {
            !builtin
                .get(&entry.name)
                .is_some_and(|shipped| shipped.content_hash == entry.content_hash)
        })
        .filter(|entry| scope.includes(entry))
        .cloned()
        .collect()
}

/// Drop candidates whose sandbox file is already present and valid, and
/// record them in the cache.
///
/// Recovers files left by an interrupted run without downloading them again.
pub fn reconcile(
    candidates: Vec<ManifestEntry>,
    cache: &mut CacheStore,
    level: VerifyLevel,
) -> BundleResult<DownloadList> {
    let (present, missing): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|entry| is_valid(&cache.cached_path(&entry.content_hash), entry, level));

    if !present.is_empty() {
        let recovered = cache.commit_batch(present.iter().map(|e| e.content_hash.as_str()))?;
        info!(recovered, "Recovered verified bundles already in the sandbox");
    }
    Ok(DownloadList::new(missing))
}

/// Compute the download list for `remote`.
pub fn download_list(
    remote: &Manifest,
    builtin: &Manifest,
    cache: &mut CacheStore,
    scope: &DownloadScope,
    level: VerifyLevel,
) -> BundleResult<DownloadList> {
    let candidates = candidates(remote, builtin, cache, scope);
    let considered = candidates.len();
    let list = reconcile(candidates, cache, level)?;

    debug!(
        scope = %scope,
        remote = remote.len(),
        considered,
        files = list.files(),
        bytes = list.bytes(),
        "Computed download list"
    );
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StorageLayout;
    use crate::verify::digest_bytes;
    use std::fs;
    use tempfile::TempDir;

    fn entry(name: &str, data: &[u8]) -> ManifestEntry {
        let d = digest_bytes(data);
        ManifestEntry::new(name, d.content_hash, d.checksum, d.size_bytes, 1)
    }

    fn open_cache(temp: &TempDir) -> CacheStore {
        let layout = StorageLayout::new(temp.path().join("builtin"), temp.path().join("sandbox"));
        CacheStore::open(layout, "1.0.0").unwrap().0
    }

    #[test]
    fn test_skips_cached_and_builtin() {
        let temp = TempDir::new().unwrap();
        let mut cache = open_cache(&temp);

        let a = entry("a", b"a-v2");
        let b = entry("b", b"b-v1");
        let c = entry("c", b"c-v2");
        let remote = Manifest::new(2, vec![a.clone(), b.clone(), c.clone()]).unwrap();
        let builtin = Manifest::new(1, vec![entry("a", b"a-v1"), b.clone()]).unwrap();
        cache.commit(&c.content_hash).unwrap();

        let list = candidates(&remote, &builtin, &cache, &DownloadScope::All);
        let names: Vec<_> = list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn test_tag_scope_keeps_untagged() {
        let temp = TempDir::new().unwrap();
        let cache = open_cache(&temp);

        let remote = Manifest::new(
            2,
            vec![
                entry("core", b"core"),
                entry("dlc1", b"dlc1").with_tags(["dlc1"]),
                entry("dlc2", b"dlc2").with_tags(["dlc2"]),
            ],
        )
        .unwrap();

        let scope = DownloadScope::Tags(vec!["dlc2".to_string()]);
        let list = candidates(&remote, &Manifest::empty(), &cache, &scope);
        let names: Vec<_> = list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["core", "dlc2"]);
    }

    #[test]
    fn test_reconcile_recovers_valid_files() {
        let temp = TempDir::new().unwrap();
        let mut cache = open_cache(&temp);

        let present = entry("present", b"already here");
        let corrupt = entry("corrupt", b"expected");
        let missing = entry("missing", b"nowhere");
        fs::write(cache.cached_path(&present.content_hash), b"already here").unwrap();
        fs::write(cache.cached_path(&corrupt.content_hash), b"EXPECTED").unwrap();

        let list = reconcile(
            vec![present.clone(), corrupt.clone(), missing.clone()],
            &mut cache,
            VerifyLevel::High,
        )
        .unwrap();

        let names: Vec<_> = list.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["corrupt", "missing"]);
        assert!(cache.contains(&present.content_hash));
        assert_eq!(list.bytes(), corrupt.size_bytes + missing.size_bytes);
    }

    #[test]
    fn test_download_list_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut cache = open_cache(&temp);

        let a = entry("a", b"aaaa");
        let b = entry("b", b"bbbb");
        fs::write(cache.cached_path(&b.content_hash), b"bbbb").unwrap();
        let remote = Manifest::new(1, vec![a, b]).unwrap();
        let builtin = Manifest::empty();

        let scope = DownloadScope::All;
        let first =
            download_list(&remote, &builtin, &mut cache, &scope, VerifyLevel::High).unwrap();
        let second =
            download_list(&remote, &builtin, &mut cache, &scope, VerifyLevel::High).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.files(), 1);
    }
}
