//! wsproxy - single-user VLESS/VMess over WebSocket tunneling proxy
//!
//! # Architecture (Layered Pipeline)
//!
//! ```text
//! WebSocket upgrade (app)
//! → Session (handshake buffering, state machine)
//! → Protocol (VLESS / VMess header codec)
//! → Transport (outbound TCP dial)
//! → Relay (WebSocket <-> TCP)
//! ```
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing
//! - The identity is resolved once and shared read-only
//! - Sessions share nothing else
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address
//! ├── identity/        # Identity resolution and persistence
//! ├── protocol/        # Header codecs: VLESS, VMess
//! ├── transport/       # Outbound dialer
//! ├── session/         # Session state machine and relay
//! └── app/             # HTTP/WebSocket listener, pages, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod identity;
pub mod protocol;
pub mod transport;
pub mod session;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, Stream};
pub use config::Config;
pub use error::{Error, Result};

pub use app::{AppState, Server};
pub use identity::{FileStore, Identity, IdentityOverrides, IdentityStore};
pub use protocol::{Framing, HeaderError};
pub use session::{Session, SessionContext, SessionEnd};
pub use transport::{DialError, Dialer, TcpDialer};
