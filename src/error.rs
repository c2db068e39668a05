//! WolfMesh Error Types

use thiserror::Error;

/// Result type alias for WolfMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    // Node identity errors
    #[error("Invalid node: {0}")]
    InvalidNode(String),

    // Topology protocol errors
    #[error("Bad topology: {0}")]
    BadTopology(String),

    #[error("No master")]
    NoMaster,

    #[error("Invalid master id: {0}")]
    InvalidMaster(String),

    #[error("Bad topology update: {0}")]
    BadUpdate(String),

    #[error("Topology out of date: local revision {local}, update based on {base}")]
    OutOfDate { local: u64, base: u64 },

    // Role errors
    #[error("{operation} is not allowed in non-master state")]
    NotMaster { operation: &'static str },

    #[error("{operation} is not allowed in master state")]
    IsMaster { operation: &'static str },

    // Wire errors
    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unsupported protocol")]
    UnsupportedProtocol,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Network errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Link closed")]
    LinkClosed,

    #[error("Message abandoned")]
    Abandoned,

    #[error("Send queue full")]
    QueueFull,

    #[error("Network error: {0}")]
    Network(String),

    // Bootstrap errors
    #[error("Bootstrap {address} failed: {reason}")]
    Bootstrap { address: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Calling a master-only operation as a member, or the reverse
    pub fn is_role_violation(&self) -> bool {
        matches!(self, Error::NotMaster { .. } | Error::IsMaster { .. })
    }

    /// Malformed peer input that is dropped rather than torn down
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidNode(_)
                | Error::BadTopology(_)
                | Error::NoMaster
                | Error::InvalidMaster(_)
                | Error::BadUpdate(_)
                | Error::Frame(_)
                | Error::Codec(_)
                | Error::Handshake(_)
                | Error::UnsupportedProtocol
                | Error::Json(_)
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::LinkClosed
                | Error::Network(_)
                | Error::Bootstrap { .. }
                | Error::Http(_)
                | Error::Io(_)
        )
    }
}
