//! Error types for the offline-media-cache library.

use thiserror::Error;

/// Errors that can occur while caching, serving or downloading media.
#[derive(Error, Debug)]
pub enum Error {
    /// The network fetch itself failed (no connectivity, DNS, reset, ...).
    #[error("Network error: {0}")]
    Network(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during cache store operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The cache store rejected or could not complete an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A mandatory core asset could not be fetched or stored during install.
    #[error("Core asset {key} failed to install: {reason}")]
    CoreAssetInstall {
        /// The core asset as configured.
        key: String,
        /// Underlying failure.
        reason: String,
    },

    /// A URL could not be parsed or resolved against the origin.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending input.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A page message could not be decoded.
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// Configuration file could not be parsed or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lifecycle operation was invoked from the wrong state.
    #[error("Invalid lifecycle transition: {0}")]
    InvalidState(String),

    /// The worker has not been activated yet.
    #[error("Worker is not active")]
    NotActive,

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl Error {
    /// Returns true if this error came from the network rather than local storage.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_))
    }
}

/// A specialized `Result` type for offline-media-cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_classified() {
        assert!(Error::Network("offline".into()).is_network());
        assert!(!Error::Storage("quota".into()).is_network());
        assert!(!Error::NotActive.is_network());
    }

    #[test]
    fn core_asset_error_names_key() {
        let e = Error::CoreAssetInstall {
            key: "/index.html".into(),
            reason: "status 404".into(),
        };
        assert_eq!(
            e.to_string(),
            "Core asset /index.html failed to install: status 404"
        );
    }
}
