//! Stream abstraction
//!
//! Outbound connections are handed around as a boxed byte stream so the
//! relay never depends on a concrete socket type.

use tokio::io::{AsyncRead, AsyncWrite};

/// The outbound stream type used by the dialer and relay.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
