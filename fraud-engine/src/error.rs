//! Error types for the fraud engine

use thiserror::Error;

/// Fraud engine error
#[derive(Debug, Error)]
pub enum Error {
    /// Per-user thresholds are inconsistent; system defaults apply instead
    #[error("Configuration fault: {0}")]
    ConfigurationFault(String),

    /// A collaborator store (aggregates, devices, alerts) is unreachable
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed transaction, rejected before scoring
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Settings write rejected
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Rule set rejected at publish time
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// No rule snapshot can be read
    #[error("Rule registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Engine configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether evaluation can continue in a degraded or defaulted mode
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConfigurationFault(_) | Error::DependencyUnavailable(_)
        )
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
