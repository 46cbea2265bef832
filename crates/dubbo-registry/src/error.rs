//! Error types for the registry client and server

use std::path::PathBuf;
use thiserror::Error;

/// Registry error type
#[derive(Error, Debug)]
pub enum Error {
    /// A URL string could not be parsed
    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl {
        /// The offending input
        url: String,
        /// What was wrong with it
        reason: String,
    },

    /// A subscribe/publish descriptor is missing a required field
    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    /// Every candidate registry address failed
    #[error("Can not connect to registry => {}", format_addresses(.addresses))]
    ConnectionExhausted {
        /// Every address that was tried
        addresses: Vec<String>,
    },

    /// The registry answered the login request with a failure
    #[error("Login to registry {address} rejected: {reason}")]
    LoginRejected {
        /// Registry address
        address: String,
        /// Failure reason
        reason: String,
    },

    /// The registry pushed an error message
    #[error("Registry server error: {0}")]
    ServerReported(String),

    /// A frame could not be decoded into a packet
    #[error("Decode error: {reason} (address: {address})")]
    Decode {
        /// Peer address
        address: String,
        /// Decoder message
        reason: String,
    },

    /// Socket or WebSocket failure on an established connection
    #[error("Transport error: {source} (address: {address})")]
    Transport {
        /// Peer address
        address: String,
        /// Underlying error
        #[source]
        source: tungstenite::Error,
    },

    /// The connection went away before the request completed
    #[error("Connection to {0} closed")]
    ConnectionClosed(String),

    /// No active registry connection
    #[error("Not connected to any registry")]
    NotConnected,

    /// No response arrived within the configured timeout
    #[error("Request #{id} to {address} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Request id
        id: u64,
        /// Peer address
        address: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// The peer answered with a non-success response
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// A local cache file could not be loaded
    #[error("Failed to load local cache file {path:?}: {reason}")]
    CacheLoad {
        /// Offending file
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_addresses(addresses: &[String]) -> String {
    addresses
        .iter()
        .map(|address| format!("\n\t- {}", address))
        .collect()
}

impl Error {
    /// Build an [`Error::InvalidUrl`]
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
