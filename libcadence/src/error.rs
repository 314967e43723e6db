//! Error types for Cadence

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Content provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl CadenceError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CadenceError::InvalidInput(_) | CadenceError::NotFound(_) => 3,
            CadenceError::Driver(DriverError::Authentication(_)) => 2,
            CadenceError::Vault(VaultError::DecryptionFailed) => 2,
            CadenceError::Config(_) | CadenceError::Database(_) => 2,
            CadenceError::Driver(_) | CadenceError::Vault(_) | CadenceError::Provider(_) => 1,
        }
    }

    /// Whether the scheduler must stop instead of retrying on the next tick
    pub fn is_fatal(&self) -> bool {
        matches!(self, CadenceError::Database(DbError::Corrupt(_)))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Persisted state that cannot be interpreted (unknown enum value,
    /// malformed JSON, out-of-range timestamp).
    #[error("Corrupt persisted state: {0}")]
    Corrupt(String),
}

/// Classified failure of a platform driver call.
///
/// Drivers translate every raw automation fault into one of these variants
/// before it leaves the driver boundary. The scheduler persists the
/// payload-free [`ErrorKind`] and feeds the full error to the retry policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Challenge detected ({marker}); manual attention required")]
    ChallengeDetected { marker: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Content too long: {actual} characters exceeds limit of {limit}")]
    ContentTooLong { limit: usize, actual: usize },

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Content provider failed: {0}")]
    Provider(String),

    #[error("Unknown failure: {0}")]
    Unknown(String),
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Authentication(_) => ErrorKind::Authentication,
            DriverError::ChallengeDetected { .. } => ErrorKind::Challenge,
            DriverError::Network(_) => ErrorKind::Network,
            DriverError::Timeout(_) => ErrorKind::Timeout,
            DriverError::ContentTooLong { .. } => ErrorKind::ContentTooLong,
            DriverError::InvalidContent(_) => ErrorKind::InvalidContent,
            DriverError::RateLimited { .. } => ErrorKind::RateLimited,
            DriverError::Provider(_) => ErrorKind::Provider,
            DriverError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

/// Payload-free tag of a [`DriverError`], persisted as `jobs.last_error_kind`
/// and as the outcome of failed execution attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Challenge,
    Network,
    Timeout,
    ContentTooLong,
    InvalidContent,
    RateLimited,
    Provider,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Challenge => "challenge",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ContentTooLong => "content_too_long",
            ErrorKind::InvalidContent => "invalid_content",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Provider => "provider",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "authentication" => Ok(ErrorKind::Authentication),
            "challenge" => Ok(ErrorKind::Challenge),
            "network" => Ok(ErrorKind::Network),
            "timeout" => Ok(ErrorKind::Timeout),
            "content_too_long" => Ok(ErrorKind::ContentTooLong),
            "invalid_content" => Ok(ErrorKind::InvalidContent),
            "rate_limited" => Ok(ErrorKind::RateLimited),
            "provider" => Ok(ErrorKind::Provider),
            "unknown" => Ok(ErrorKind::Unknown),
            other => Err(format!("unknown error kind '{}'", other)),
        }
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Master key must be at least 8 characters")]
    WeakKey,

    #[error("Master key not available (set CADENCE_MASTER_KEY or run interactively)")]
    MasterKeyMissing,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption failed (wrong master key or corrupted credential)")]
    DecryptionFailed,

    #[error("Unsupported credential algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Content provider not configured: {0}")]
    NotConfigured(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CadenceError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_not_found() {
        let error = CadenceError::NotFound("job 42".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = CadenceError::Driver(DriverError::Authentication("bad password".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_config_and_database() {
        let config = CadenceError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(config.exit_code(), 2);

        let db = CadenceError::Database(DbError::Corrupt("state 'bogus'".to_string()));
        assert_eq!(db.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_runtime_errors() {
        let network = CadenceError::Driver(DriverError::Network("reset".to_string()));
        assert_eq!(network.exit_code(), 1);

        let provider = CadenceError::Provider(ProviderError::InvalidResponse("empty".to_string()));
        assert_eq!(provider.exit_code(), 1);
    }

    #[test]
    fn test_only_corrupt_state_is_fatal() {
        assert!(CadenceError::Database(DbError::Corrupt("x".to_string())).is_fatal());
        assert!(!CadenceError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk"
        )))
        .is_fatal());
        assert!(!CadenceError::InvalidInput("x".to_string()).is_fatal());
    }

    #[test]
    fn test_error_message_formatting() {
        let error = CadenceError::Driver(DriverError::ContentTooLong {
            limit: 280,
            actual: 300,
        });
        assert_eq!(
            error.to_string(),
            "Driver error: Content too long: 300 characters exceeds limit of 280"
        );

        let challenge = DriverError::ChallengeDetected {
            marker: "checkpoint".to_string(),
        };
        assert!(challenge.to_string().contains("checkpoint"));
    }

    #[test]
    fn test_driver_error_kind_mapping() {
        assert_eq!(
            DriverError::Network("x".to_string()).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            DriverError::RateLimited {
                retry_after: None,
                message: "slow down".to_string()
            }
            .kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            DriverError::ChallengeDetected {
                marker: "captcha".to_string()
            }
            .kind(),
            ErrorKind::Challenge
        );
    }

    #[test]
    fn test_error_kind_string_round_trip() {
        let kinds = [
            ErrorKind::Authentication,
            ErrorKind::Challenge,
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::ContentTooLong,
            ErrorKind::InvalidContent,
            ErrorKind::RateLimited,
            ErrorKind::Provider,
            ErrorKind::Unknown,
        ];
        for kind in kinds {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("exploded".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_driver_error_clone() {
        let original = DriverError::Timeout("publish_text".to_string());
        let cloned = original.clone();
        assert_eq!(original, cloned);
    }

    #[test]
    fn test_error_conversion_from_vault_error() {
        let error: CadenceError = VaultError::DecryptionFailed.into();
        match error {
            CadenceError::Vault(VaultError::DecryptionFailed) => {}
            other => panic!("Expected vault error, got {:?}", other),
        }
    }
}
