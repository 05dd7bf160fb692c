//! Integrity verification of bundle files against manifest entries.
//!
//! Files are checked at one of three strictness levels:
//!
//! - [`VerifyLevel::Low`]: the file exists
//! - [`VerifyLevel::Middle`]: the file exists and its size matches
//! - [`VerifyLevel::High`]: size, SHA-256 content hash and CRC-32 checksum match
//!
//! Hash and checksum are computed in a single streaming pass.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use flate2::Crc;
use sha2::{Digest, Sha256};

use crate::error::{BundleError, BundleResult, IntegrityKind};
use crate::manifest::ManifestEntry;

/// Buffer size for reading files during hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// How strictly a file is checked against its manifest entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyLevel {
    /// File exists.
    Low,
    /// File exists and has the expected size.
    Middle,
    /// Size, content hash and checksum all match.
    #[default]
    High,
}

impl fmt::Display for VerifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Middle => write!(f, "middle"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for VerifyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "middle" => Ok(Self::Middle),
            "high" => Ok(Self::High),
            other => Err(format!("unknown verify level '{}'", other)),
        }
    }
}

/// Content digests of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hex SHA-256.
    pub content_hash: String,
    /// Lowercase 8-digit hex CRC-32.
    pub checksum: String,
    pub size_bytes: u64,
}

/// Compute SHA-256, CRC-32 and size of a byte slice.
pub fn digest_bytes(data: &[u8]) -> FileDigest {
    let mut hasher = Sha256::new();
    let mut crc = Crc::new();
    hasher.update(data);
    crc.update(data);
    FileDigest {
        content_hash: format!("{:x}", hasher.finalize()),
        checksum: format!("{:08x}", crc.sum()),
        size_bytes: data.len() as u64,
    }
}

/// Compute SHA-256, CRC-32 and size of a file in one pass.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn digest_file(path: &Path) -> BundleResult<FileDigest> {
    let mut file = File::open(path).map_err(|e| BundleError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    let mut crc = Crc::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| BundleError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
        crc.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(FileDigest {
        content_hash: format!("{:x}", hasher.finalize()),
        checksum: format!("{:08x}", crc.sum()),
        size_bytes: size,
    })
}

/// Verify a file against a manifest entry at the given level.
///
/// Returns `Ok(())` when the file passes, or [`BundleError::Integrity`]
/// describing the first mismatch.
pub fn verify_file(path: &Path, entry: &ManifestEntry, level: VerifyLevel) -> BundleResult<()> {
    let fail = |kind| BundleError::Integrity {
        bundle: entry.name.clone(),
        kind,
    };

    let metadata = match path.metadata() {
        Ok(m) if m.is_file() => m,
        _ => return Err(fail(IntegrityKind::Missing)),
    };

    if level == VerifyLevel::Low {
        return Ok(());
    }

    if metadata.len() != entry.size_bytes {
        return Err(fail(IntegrityKind::Size {
            expected: entry.size_bytes,
            actual: metadata.len(),
        }));
    }

    if level == VerifyLevel::Middle {
        return Ok(());
    }

    let digest = digest_file(path)?;
    if !digest.content_hash.eq_ignore_ascii_case(&entry.content_hash) {
        return Err(fail(IntegrityKind::Hash {
            expected: entry.content_hash.clone(),
            actual: digest.content_hash,
        }));
    }
    if !digest.checksum.eq_ignore_ascii_case(&entry.checksum) {
        return Err(fail(IntegrityKind::Checksum {
            expected: entry.checksum.clone(),
            actual: digest.checksum,
        }));
    }
    Ok(())
}

/// Check a file without surfacing the reason.
pub fn is_valid(path: &Path, entry: &ManifestEntry, level: VerifyLevel) -> bool {
    verify_file(path, entry, level).is_ok()
}
