//! Error types for chatline operations

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Connection-level failures. Never fatal to the connection manager; they
/// drive the reconnection policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Connection closed unexpectedly (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Send failed: {reason}")]
    Send { reason: String },
}

/// Remote call failures, shared by every caller waiting on the same fetch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Remote call failed: {0}")]
    Remote(Arc<dyn StdError + Send + Sync>),

    #[error("Remote call failed: {reason}")]
    Failed { reason: String },

    #[error("Remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {reason}")]
    Decode { reason: String },

    #[error("Fetch aborted before completion: {reason}")]
    Aborted { reason: String },
}

impl FetchError {
    /// Wrap any error produced by a fetcher.
    pub fn remote<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Remote(Arc::new(err))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// HTTP status for `Status` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Durable store failures. Logged and treated as "no persisted data".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Persistence I/O error: {reason}")]
    Io { reason: String },

    #[error("Persistence serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Persistence backend error: {reason}")]
    Backend { reason: String },
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or CHATLINE_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Master error type for all chatline errors.
#[derive(Debug, Clone, Error)]
pub enum ChatlineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for chatline operations.
pub type ChatlineResult<T> = Result<T, ChatlineError>;

// =============================================================================
// TESTS
// =============================================================================
