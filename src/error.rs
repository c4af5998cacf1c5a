//! Error types for the parley voice client

use thiserror::Error;

/// Result type alias for parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the parley voice client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Relay credential endpoint error
    #[error("relay error: {0}")]
    Relay(String),

    /// Realtime channel error
    #[error("transport error: {0}")]
    Transport(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Reasoning gateway error
    #[error("reasoning error: {0}")]
    Reasoning(String),

    /// Knowledge store error
    #[error("knowledge error: {0}")]
    Knowledge(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
