//! Bundle container format.
//!
//! A bundle file is a 4-byte magic followed by a bincode-encoded
//! [`BundleArchive`]. Assets are addressed by slash-separated paths; the
//! sub-assets of a name are the assets stored below `name/`.

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, BundleResult};

/// Leading bytes of every bundle container.
pub const ARCHIVE_MAGIC: &[u8; 4] = b"BFLA";

/// Container format revision.
pub const ARCHIVE_FORMAT: u16 = 1;

/// What an archived asset holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    Object,
    Scene,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: AssetKind,
    pub data: Vec<u8>,
}

/// An opened bundle container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleArchive {
    format: u16,
    entries: Vec<ArchiveEntry>,
}

impl BundleArchive {
    pub fn new() -> Self {
        Self {
            format: ARCHIVE_FORMAT,
            entries: Vec::new(),
        }
    }

    pub fn with_object(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.push(path.into(), AssetKind::Object, data.into());
        self
    }

    pub fn with_scene(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.push(path.into(), AssetKind::Scene, data.into());
        self
    }

    /// Add an entry, replacing any entry with the same path.
    pub fn push(&mut self, path: String, kind: AssetKind, data: Vec<u8>) {
        self.entries.retain(|e| e.path != path);
        self.entries.push(ArchiveEntry { path, kind, data });
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Assets stored below `name/`, in archive order.
    pub fn sub_assets<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ArchiveEntry> + 'a {
        self.entries.iter().filter(move |e| is_below(&e.path, name))
    }

    /// Encode the container.
    pub fn to_bytes(&self) -> BundleResult<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| BundleError::InvalidContainer {
            bundle: String::new(),
            reason: e.to_string(),
        })?;
        let mut out = Vec::with_capacity(ARCHIVE_MAGIC.len() + body.len());
        out.extend_from_slice(ARCHIVE_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a container read from `bundle`.
    pub fn from_bytes(bundle: &str, data: &[u8]) -> BundleResult<Self> {
        let invalid = |reason: String| BundleError::InvalidContainer {
            bundle: bundle.to_string(),
            reason,
        };

        let body = data
            .strip_prefix(ARCHIVE_MAGIC.as_slice())
            .ok_or_else(|| invalid("missing container header".to_string()))?;
        let archive: Self = bincode::deserialize(body).map_err(|e| invalid(e.to_string()))?;
        if archive.format != ARCHIVE_FORMAT {
            return Err(invalid(format!(
                "unsupported container format {}",
                archive.format
            )));
        }
        Ok(archive)
    }
}

/// Whether `path` lies below the directory-like `name`.
pub(crate) fn is_below(path: &str, name: &str) -> bool {
    let name = name.trim_end_matches('/');
    name.is_empty()
        || path
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BundleArchive {
        BundleArchive::new()
            .with_object("ui/icons/play", b"play".to_vec())
            .with_object("ui/icons/stop", b"stop".to_vec())
            .with_object("ui/iconset", b"set".to_vec())
            .with_scene("levels/intro", b"scene".to_vec())
    }

    #[test]
    fn test_decode_encoded_archive() {
        let bytes = sample().to_bytes().unwrap();
        assert!(bytes.starts_with(ARCHIVE_MAGIC));

        let archive = BundleArchive::from_bytes("ui", &bytes).unwrap();
        assert_eq!(archive.len(), 4);
        assert_eq!(archive.get("levels/intro").unwrap().kind, AssetKind::Scene);
    }

    #[test]
    fn test_sub_assets_match_whole_segments() {
        let archive = sample();
        let names: Vec<_> = archive.sub_assets("ui/icons").map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["ui/icons/play", "ui/icons/stop"]);
    }

    #[test]
    fn test_push_replaces_same_path() {
        let mut archive = sample();
        archive.push("ui/iconset".to_string(), AssetKind::Object, b"new".to_vec());
        assert_eq!(archive.len(), 4);
        assert_eq!(archive.get("ui/iconset").unwrap().data, b"new");
    }

    #[test]
    fn test_rejects_garbage() {
        let err = BundleArchive::from_bytes("ui", b"not a bundle").unwrap_err();
        assert!(matches!(err, BundleError::InvalidContainer { .. }));

        let mut bytes = sample().to_bytes().unwrap();
        bytes.truncate(10);
        assert!(BundleArchive::from_bytes("ui", &bytes).is_err());
    }
}
