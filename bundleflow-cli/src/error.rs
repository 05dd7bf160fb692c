//! CLI error type and exit codes.

use std::fmt;

use bundleflow::logging::LoggingError;
use bundleflow::update::UpdateFailure;
use bundleflow::{BundleError, ConfigError};

/// Errors reported by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Configuration could not be loaded or is invalid.
    Config(String),
    /// Logging could not be set up.
    Logging(LoggingError),
    /// The engine reported an error.
    Bundle(BundleError),
    /// A manifest failed validation.
    InvalidManifest(String),
    /// Bundle files failed verification.
    VerificationFailed { failed: usize, total: usize },
    /// An update step failed and was not recovered.
    UpdateFailed(UpdateFailure),
    /// The server requires a newer app build.
    MustReinstall { required: String, current: String },
    /// The operator aborted.
    Aborted,
    /// Reading operator input failed.
    Prompt(String),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Logging(_) => 2,
            Self::InvalidManifest(_) | Self::VerificationFailed { .. } => 3,
            Self::UpdateFailed(_) => 4,
            Self::MustReinstall { .. } => 5,
            Self::Aborted => 130,
            Self::Bundle(_) | Self::Prompt(_) => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Logging(e) => write!(f, "Logging error: {}", e),
            Self::Bundle(e) => write!(f, "{}", e),
            Self::InvalidManifest(msg) => write!(f, "Invalid manifest: {}", msg),
            Self::VerificationFailed { failed, total } => {
                write!(f, "{} of {} bundle files failed verification", failed, total)
            }
            Self::UpdateFailed(failure) => write!(f, "Update failed: {}", failure),
            Self::MustReinstall { required, current } => write!(
                f,
                "This build ({}) is too old for the server's resources; install {} or newer",
                current, required
            ),
            Self::Aborted => write!(f, "Aborted"),
            Self::Prompt(msg) => write!(f, "Failed to read input: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<BundleError> for CliError {
    fn from(e: BundleError) -> Self {
        match e {
            BundleError::Config(msg) => Self::Config(msg),
            other => Self::Bundle(other),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        Self::Logging(e)
    }
}

impl From<dialoguer::Error> for CliError {
    fn from(e: dialoguer::Error) -> Self {
        Self::Prompt(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        assert_eq!(CliError::Config("x".into()).exit_code(), 2);
        assert_eq!(CliError::Aborted.exit_code(), 130);
        assert_eq!(
            CliError::MustReinstall {
                required: "2.0.0".into(),
                current: "1.0.0".into()
            }
            .exit_code(),
            5
        );
    }

    #[test]
    fn test_config_bundle_error_maps_to_config() {
        let err: CliError = BundleError::Config("unknown decryption strategy".into()).into();
        assert!(matches!(err, CliError::Config(_)));
        assert_eq!(err.exit_code(), 2);
    }
}
