//! Error types for evalbridge.
//!
//! Every fallible operation in the crate returns [`BridgeError`]. Remote
//! execution errors never show up here: the remote host traps them itself
//! and only reports through its own console.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Evaluation errors
    #[error("Remote evaluation failed: {message}")]
    RemoteEvaluation { message: String },

    #[error("An evaluation is already awaiting a reply")]
    EvaluationInFlight,

    #[error("Environment is {actual}, expected {expected}")]
    InvalidState { expected: String, actual: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Unit source errors
    #[error("HTTP error fetching {url}: {message}")]
    Http { url: String, message: String },

    #[error("Unit source not found: {0}")]
    UnitNotFound(String),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return BridgeError::Timeout(Duration::from_secs(0));
        }
        BridgeError::Http {
            url: err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: err.to_string(),
        }
    }
}

impl BridgeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Connection lost while a reply was outstanding.
    pub fn disconnected() -> Self {
        BridgeError::RemoteEvaluation {
            message: "connection to the remote host was lost before a reply arrived".to_string(),
        }
    }

    /// A request was issued while no remote host is attached.
    pub fn not_connected() -> Self {
        BridgeError::RemoteEvaluation {
            message: "no remote host is connected".to_string(),
        }
    }

    /// Error for a poisoned internal lock.
    pub(crate) fn poisoned(what: &str) -> Self {
        BridgeError::Other(format!("{} lock poisoned", what))
    }

    /// True when the error means the remote side went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BridgeError::RemoteEvaluation { .. })
    }
}
