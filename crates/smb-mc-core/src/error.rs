//! Error types for the multichannel core
//!
//! Infeasible pairings, failed connect attempts and vanished NICs are
//! modelled as connection/NIC states, not as errors. The variants below
//! cover the remaining failure modes: configuration, collaborator
//! failures, malformed discovery input and selector non-convergence.

use thiserror::Error;

/// Result type alias for multichannel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the multichannel connection manager
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-layer errors (connect/disconnect)
    #[error("Transport error: {0}")]
    Transport(String),

    /// NIC discovery errors
    #[error("NIC source error: {0}")]
    NicSource(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unknown NIC, connection or plugin
    #[error("Not found: {0}")]
    NotFound(String),

    /// A NETWORK_INTERFACE_INFO buffer could not be decoded
    #[error("Malformed interface info: {0}")]
    MalformedInterfaceInfo(String),

    /// The selector did not reach a fixed point within its pass budget.
    ///
    /// The coordinator rolls back to the last stable configuration before
    /// returning this.
    #[error("Selector did not converge after {passes} passes")]
    NonConvergence {
        /// Number of passes attempted
        passes: usize,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a NIC source error
    pub fn nic_source(msg: impl Into<String>) -> Self {
        Self::NicSource(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a malformed interface info error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInterfaceInfo(msg.into())
    }

    /// Whether this error is the selector defect condition
    pub fn is_non_convergence(&self) -> bool {
        matches!(self, Self::NonConvergence { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
