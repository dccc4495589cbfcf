//! Error types for nexrad-sync
//!
//! Per-task transfer errors never abort a run: workers capture them in their
//! counters and log lines. Only configuration and setup errors surface to the
//! caller as `Err`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for nexrad-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nexrad-sync
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download.concurrency")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level HTTP error (connect, timeout, body read)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The object store answered with a non-success status
    #[error("object store returned HTTP {status} for '{key}'")]
    Store {
        /// HTTP status code returned by the store
        status: u16,
        /// Object key or listing prefix the request was for
        key: String,
    },

    /// A bucket listing response could not be decoded
    #[error("failed to decode bucket listing: {0}")]
    ListingDecode(#[from] quick_xml::DeError),

    /// The transferred file does not have the advertised size
    #[error("size mismatch for '{key}': expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        /// Remote key of the object
        key: String,
        /// Size advertised by the listing
        expected: u64,
        /// Size found on disk after the transfer
        actual: u64,
    },

    /// A single transfer attempt exceeded the configured attempt timeout
    #[error("transfer of '{key}' timed out after {timeout:?}")]
    TransferTimeout {
        /// Remote key of the object
        key: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Local input or output path is unusable
    #[error("invalid path {path}: {reason}")]
    InvalidPath {
        /// The offending path
        path: PathBuf,
        /// Why the path was rejected
        reason: String,
    },

    /// External tool execution failed (wct-export)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The kill signal was observed before the operation could start
    #[error("operation cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a configuration error for a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}
