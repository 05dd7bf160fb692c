//! Manifest entry type.

use serde::{Deserialize, Serialize};

/// Per-bundle flags recorded at build time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlags {
    /// The file on disk must be decrypted before it can be opened.
    #[serde(default)]
    pub is_encrypted: bool,
    /// The file ships in the read-only built-in root.
    #[serde(default)]
    pub is_builtin: bool,
    /// The file is an opaque blob rather than a bundle container.
    #[serde(default)]
    pub is_raw_file: bool,
}

/// Description of a single bundle in a manifest.
///
/// Entries are immutable once a manifest is built; two entries describe the
/// same bytes exactly when their `content_hash` values are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Unique bundle name within the manifest.
    pub name: String,
    /// SHA-256 of the file contents (lowercase hex). Also the cache file name.
    pub content_hash: String,
    /// CRC-32 of the file contents (8 lowercase hex digits).
    pub checksum: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Build version that last changed this bundle.
    pub version: u32,
    /// Names of bundles this bundle depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Tags used for partial downloads.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub flags: EntryFlags,
}

impl ManifestEntry {
    /// Create an entry with no dependencies, tags or flags.
    pub fn new(
        name: impl Into<String>,
        content_hash: impl Into<String>,
        checksum: impl Into<String>,
        size_bytes: u64,
        version: u32,
    ) -> Self {
        Self {
            name: name.into(),
            content_hash: content_hash.into(),
            checksum: checksum.into(),
            size_bytes,
            version,
            dependencies: Vec::new(),
            tags: Vec::new(),
            flags: EntryFlags::default(),
        }
    }

    /// Set the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the tag list.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the flags.
    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Untagged entries are always synchronized.
    pub fn is_untagged(&self) -> bool {
        self.tags.is_empty()
    }

    /// Check whether any of the entry's tags is in `tags`.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }
}
