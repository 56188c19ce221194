//! Outbound Dialer
//!
//! Responsibilities:
//! - Open a raw TCP connection to the requested destination
//! - Apply the relay-through redirect, if configured
//! - Bound every attempt by the dial timeout
//! - NO encryption, NO protocol parsing
//!
//! This layer ONLY deals with raw byte transport.

mod tcp;

pub use tcp::TcpDialer;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::{Address, Stream};

/// Dial failure, classified by reason
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("connection timed out")]
    Timeout,

    #[error("connection refused")]
    Refused,

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),
}

impl DialError {
    /// Short reason code for logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            DialError::Timeout => "timeout",
            DialError::Refused => "refused",
            DialError::Unreachable(_) => "unreachable",
            DialError::Dns(_) => "dns",
        }
    }

    pub(crate) fn from_io(e: &std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => DialError::Refused,
            std::io::ErrorKind::TimedOut => DialError::Timeout,
            _ => DialError::Unreachable(e.to_string()),
        }
    }
}

/// Opens outbound connections for sessions
///
/// Implementations should ONLY handle connection establishment.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to the destination taken from a handshake header
    async fn dial(&self, target: &Address) -> Result<Stream, DialError>;
}
