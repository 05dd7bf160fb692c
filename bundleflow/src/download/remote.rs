//! Remote endpoint layout with primary/fallback alternation.

/// File fetched to learn the latest resource version.
pub const VERSION_FILENAME: &str = "version.json";

/// Primary and fallback hosts serving manifests and bundles.
///
/// ```text
/// {server}/version.json
/// {server}/{resource_version}/{manifest_file}
/// {server}/{resource_version}/{content_hash}
/// ```
///
/// The host is chosen per attempt: even attempts use the primary host and
/// odd attempts the fallback, so consecutive retries of the same file
/// alternate between hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServices {
    primary: String,
    fallback: String,
    manifest_file: String,
}

impl RemoteServices {
    /// Create remote services. Trailing slashes are trimmed.
    pub fn new(
        primary: impl Into<String>,
        fallback: impl Into<String>,
        manifest_file: impl Into<String>,
    ) -> Self {
        Self {
            primary: primary.into().trim_end_matches('/').to_string(),
            fallback: fallback.into().trim_end_matches('/').to_string(),
            manifest_file: manifest_file.into(),
        }
    }

    /// Remote services with a single host used for both roles.
    pub fn single(host: impl Into<String>, manifest_file: impl Into<String>) -> Self {
        let host = host.into();
        Self::new(host.clone(), host, manifest_file)
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    pub fn manifest_file(&self) -> &str {
        &self.manifest_file
    }

    /// Host for the given 0-based attempt.
    pub fn host(&self, attempt: u32) -> &str {
        if attempt % 2 == 0 {
            &self.primary
        } else {
            &self.fallback
        }
    }

    pub fn version_url(&self, attempt: u32) -> String {
        format!("{}/{}", self.host(attempt), VERSION_FILENAME)
    }

    pub fn manifest_url(&self, resource_version: u32, attempt: u32) -> String {
        format!(
            "{}/{}/{}",
            self.host(attempt),
            resource_version,
            self.manifest_file
        )
    }

    pub fn bundle_url(&self, resource_version: u32, content_hash: &str, attempt: u32) -> String {
        format!("{}/{}/{}", self.host(attempt), resource_version, content_hash)
    }
}
