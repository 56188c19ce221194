//! Application Layer
//!
//! This module contains:
//! - Server: the single HTTP/WebSocket listener
//! - Pages: landing and client configuration pages
//! - Metrics: Prometheus registry and session counters

pub mod metrics;
mod pages;
mod server;

pub use pages::{share_link, PublicHost};
pub use server::{build_router, AppState, Server, DRAIN_TIMEOUT};
