//! Error types for wsproxy

use thiserror::Error;

use crate::protocol::HeaderError;

/// Main error type for wsproxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Handshake rejected: {0}")]
    Header(#[from] HeaderError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Result type alias for wsproxy
pub type Result<T> = std::result::Result<T, Error>;
