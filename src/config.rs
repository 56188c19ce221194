//! Configuration module for wsproxy
//!
//! Settings are layered: built-in defaults, then environment variables,
//! then command line flags (applied by the binary). The environment is read
//! once at startup through a lookup function so tests can inject values.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::IdentityOverrides;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8000;

/// Default identity file
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Default outbound dial timeout in seconds
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;

/// Default idle timeout in seconds
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default cap on a single WebSocket message (64 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Environment variable names
pub mod env {
    pub const LISTEN: &str = "LISTEN";
    pub const PORT: &str = "PORT";
    pub const UUID: &str = "UUID";
    pub const PROTOCOL: &str = "PROTOCOL";
    pub const PROXY_IP: &str = "PROXYIP";
    pub const CONFIG_PATH: &str = "CONFIG_PATH";
    pub const DIAL_TIMEOUT: &str = "DIAL_TIMEOUT";
    pub const IDLE_TIMEOUT: &str = "IDLE_TIMEOUT";
}

/// Process configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the HTTP/WebSocket endpoint
    pub listen: SocketAddr,

    /// Identifier override
    pub uuid: Option<String>,

    /// Protocol override (`vless` / `vmess`)
    pub protocol: Option<String>,

    /// Relay-through host for every outbound dial
    pub proxy_ip: Option<String>,

    /// Identity persistence file
    pub config_path: PathBuf,

    pub dial_timeout_secs: u64,

    /// Handshake wait and relay inactivity bound
    pub idle_timeout_secs: u64,

    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            uuid: None,
            protocol: None,
            proxy_ip: None,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Config {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(port) = get(env::PORT) {
            config.listen.set_port(parse_port(&port)?);
        }
        if let Some(listen) = get(env::LISTEN) {
            config.listen = parse_listen(&listen)?;
        }
        config.uuid = get(env::UUID);
        config.protocol = get(env::PROTOCOL);
        config.proxy_ip = get(env::PROXY_IP);
        if let Some(path) = get(env::CONFIG_PATH) {
            config.config_path = PathBuf::from(path);
        }
        if let Some(secs) = get(env::DIAL_TIMEOUT) {
            config.dial_timeout_secs = parse_secs(env::DIAL_TIMEOUT, &secs)?;
        }
        if let Some(secs) = get(env::IDLE_TIMEOUT) {
            config.idle_timeout_secs = parse_secs(env::IDLE_TIMEOUT, &secs)?;
        }

        Ok(config)
    }

    /// Identity overrides carried by this configuration
    pub fn identity_overrides(&self) -> IdentityOverrides {
        IdentityOverrides {
            uuid: self.uuid.clone(),
            protocol: self.protocol.clone(),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Parse a listen address: `host:port`, `[v6]:port`, or a bare port
pub fn parse_listen(s: &str) -> Result<SocketAddr> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(port) = s.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    Err(Error::Config(format!("Invalid listen address: {}", s)))
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid port: {}", s)))
}

/// Parse a positive number of seconds
pub fn parse_secs(name: &str, s: &str) -> Result<u64> {
    match s.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(Error::Config(format!(
            "{} must be a positive number of seconds, got {:?}",
            name, s
        ))),
    }
}
