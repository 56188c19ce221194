//! TCP dialer

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::common::{Address, Stream};

use super::{DialError, Dialer};

/// Default bound on a whole dial, resolution included
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP dialer with an overall timeout and optional redirect
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
    /// Relay-through host; replaces the destination host, keeps the port
    proxy_ip: Option<String>,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            proxy_ip: None,
        }
    }

    pub fn with_proxy_ip(mut self, proxy_ip: Option<String>) -> Self {
        self.proxy_ip = proxy_ip.filter(|ip| !ip.trim().is_empty());
        self
    }

    /// Address actually dialed for a header destination
    pub fn effective_target(&self, target: &Address) -> Address {
        match &self.proxy_ip {
            Some(host) => target.with_host(host.trim()),
            None => target.clone(),
        }
    }

    async fn resolve(&self, target: &Address) -> Result<Vec<SocketAddr>, DialError> {
        let (host, port) = match target {
            Address::Socket(addr) => return Ok(vec![*addr]),
            Address::Domain(host, port) => (host.as_str(), *port),
        };

        let resolved = lookup_host((host, port))
            .await
            .map_err(|e| DialError::Dns(format!("{}: {}", host, e)))?;

        // IPv4 first, IPv6 as fallback
        let (mut addrs, v6): (Vec<_>, Vec<_>) = resolved.partition(SocketAddr::is_ipv4);
        addrs.extend(v6);
        if addrs.is_empty() {
            return Err(DialError::Dns(format!("{}: no addresses", host)));
        }
        Ok(addrs)
    }

    async fn connect_any(&self, target: &Address) -> Result<TcpStream, DialError> {
        let addrs = self.resolve(target).await?;
        let mut last_err = DialError::Unreachable(target.to_string());

        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = DialError::from_io(&e);
                }
            }
        }
        Err(last_err)
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &Address) -> Result<Stream, DialError> {
        let target = self.effective_target(target);
        let deadline = Instant::now() + self.timeout;

        let stream = timeout_at(deadline, self.connect_any(&target))
            .await
            .map_err(|_| DialError::Timeout)??;

        // Disable Nagle's algorithm for lower latency
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", target, e);
        }

        Ok(Box::new(stream))
    }
}
