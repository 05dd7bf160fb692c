//! Error types for bundle distribution and loading.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for bundleflow operations.
pub type BundleResult<T> = Result<T, BundleError>;

/// What part of an integrity check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityKind {
    /// The file does not exist.
    Missing,
    /// The file size differs from the manifest.
    Size { expected: u64, actual: u64 },
    /// The SHA-256 content hash differs from the manifest.
    Hash { expected: String, actual: String },
    /// The CRC-32 checksum differs from the manifest.
    Checksum { expected: String, actual: String },
}

impl std::fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "file is missing"),
            Self::Size { expected, actual } => {
                write!(f, "size mismatch: expected {}, got {}", expected, actual)
            }
            Self::Hash { expected, actual } => {
                write!(f, "hash mismatch: expected {}, got {}", expected, actual)
            }
            Self::Checksum { expected, actual } => {
                write!(f, "checksum mismatch: expected {}, got {}", expected, actual)
            }
        }
    }
}

/// Errors that can occur while updating, caching or loading bundles.
#[derive(Debug, Error)]
pub enum BundleError {
    /// HTTP request failed or returned an error status.
    #[error("network failure for {url}: {reason}")]
    Network { url: String, reason: String },

    /// A transfer timed out or stopped making progress.
    #[error("request to {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    /// A downloaded or cached file did not match its manifest entry.
    #[error("integrity check failed for bundle {bundle}: {kind}")]
    Integrity { bundle: String, kind: IntegrityKind },

    /// Duplicate bundle names or dangling dependency names.
    #[error("manifest inconsistency: {0}")]
    ManifestInconsistency(String),

    /// A bundle transitively depends on itself.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    /// The manifest document could not be parsed.
    #[error("failed to parse manifest from {source_name}: {reason}")]
    ManifestParse { source_name: String, reason: String },

    /// Failed to read a file or directory.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write a file.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// The bundle is not listed in the active manifest.
    #[error("unknown bundle: {0}")]
    UnknownBundle(String),

    /// The asset is not present in the opened bundle.
    #[error("asset {asset} not found in bundle {bundle}")]
    UnknownAsset { bundle: String, asset: String },

    /// No local or remote location could be resolved for the bundle.
    #[error("bundle {0} has no resolvable location")]
    Unresolvable(String),

    /// Decryption strategy failed or is not registered.
    #[error("decryption failed for bundle {bundle}: {reason}")]
    Decryption { bundle: String, reason: String },

    /// The opened file is not a valid bundle container.
    #[error("invalid bundle container {bundle}: {reason}")]
    InvalidContainer { bundle: String, reason: String },

    /// A dependency of the bundle failed to load.
    #[error("dependency {dependency} of bundle {bundle} failed")]
    DependencyFailed { bundle: String, dependency: String },

    /// The request was torn down by a forced unload.
    #[error("bundle {0} was force unloaded")]
    ForceUnloaded(String),

    /// A blocking wait exceeded its iteration ceiling.
    #[error("waiting for bundle {bundle} exceeded {iterations} iterations")]
    WaitCeilingReached { bundle: String, iterations: u64 },

    /// A handle does not refer to a live loader or provider.
    #[error("stale handle: {0}")]
    StaleHandle(String),

    /// The download batch was cancelled.
    #[error("download batch cancelled")]
    Cancelled,

    /// An operator signal arrived at a step that cannot act on it.
    #[error("signal {signal} is not valid while {state}")]
    InvalidSignal { signal: String, state: String },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BundleError {
    /// Whether the error is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::Integrity { .. }
        )
    }

    /// Whether the error is a structural manifest problem that must stop
    /// initialization.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ManifestInconsistency(_) | Self::DependencyCycle { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_joins_path() {
        let err = BundleError::DependencyCycle {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_integrity_display() {
        let err = BundleError::Integrity {
            bundle: "ui".to_string(),
            kind: IntegrityKind::Size {
                expected: 10,
                actual: 4,
            },
        };
        assert!(err.to_string().contains("ui"));
        assert!(err.to_string().contains("expected 10, got 4"));
        assert!(err.is_transient());
    }
}
