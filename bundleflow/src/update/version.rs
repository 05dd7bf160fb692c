//! Remote version document.

use serde::{Deserialize, Serialize};

use crate::download::VERSION_FILENAME;
use crate::error::{BundleError, BundleResult};

/// The server's current resource version and the oldest app build that can
/// consume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDocument {
    pub resource_version: u32,
    pub min_app_version: String,
}

impl VersionDocument {
    pub fn new(resource_version: u32, min_app_version: impl Into<String>) -> Self {
        Self {
            resource_version,
            min_app_version: min_app_version.into(),
        }
    }

    pub fn from_json(content: &str) -> BundleResult<Self> {
        let doc: Self = serde_json::from_str(content).map_err(|e| BundleError::ManifestParse {
            source_name: VERSION_FILENAME.to_string(),
            reason: e.to_string(),
        })?;
        parse_version(&doc.min_app_version)?;
        Ok(doc)
    }

    pub fn to_json(&self) -> BundleResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BundleError::ManifestParse {
            source_name: VERSION_FILENAME.to_string(),
            reason: e.to_string(),
        })
    }

    /// Whether `app_version` is older than the minimum this server accepts.
    pub fn requires_reinstall(&self, app_version: &str) -> BundleResult<bool> {
        let minimum = parse_version(&self.min_app_version)?;
        let current = parse_version(app_version)?;
        Ok(current < minimum)
    }
}

fn parse_version(version: &str) -> BundleResult<semver::Version> {
    semver::Version::parse(version.trim()).map_err(|e| BundleError::ManifestParse {
        source_name: VERSION_FILENAME.to_string(),
        reason: format!("invalid app version '{}': {}", version, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_comparison() {
        let doc = VersionDocument::new(4, "1.10.0");
        assert!(doc.requires_reinstall("1.9.3").unwrap());
        assert!(!doc.requires_reinstall("1.10.0").unwrap());
        assert!(!doc.requires_reinstall("2.0.0").unwrap());
    }

    #[test]
    fn test_parse() {
        let doc =
            VersionDocument::from_json(r#"{ "resource_version": 9, "min_app_version": "1.2.0" }"#)
                .unwrap();
        assert_eq!(doc, VersionDocument::new(9, "1.2.0"));

        let bad =
            VersionDocument::from_json(r#"{ "resource_version": 9, "min_app_version": "x" }"#);
        assert!(matches!(bad, Err(BundleError::ManifestParse { .. })));
    }
}
