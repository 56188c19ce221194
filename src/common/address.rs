//! Address type for tunnel destinations

use std::net::{IpAddr, SocketAddr};

/// Destination address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port, resolved at dial time
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }

    /// Parse a bare host (IP literal, bracketed IPv6, or domain) and attach a port
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::ip_port(ip, port),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Replace the host, keeping the port
    pub fn with_host(&self, host: &str) -> Self {
        Address::from_host(host, self.port())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_from_host_ip_literals() {
        assert_eq!(
            Address::from_host("10.0.0.1", 443),
            Address::ip_port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 443)
        );
        assert_eq!(
            Address::from_host("[::1]", 80),
            Address::ip_port(IpAddr::V6(Ipv6Addr::LOCALHOST), 80)
        );
    }

    #[test]
    fn test_with_host_keeps_port() {
        let addr = Address::domain("example.com", 8443);
        let redirected = addr.with_host("relay.internal");
        assert_eq!(redirected, Address::domain("relay.internal", 8443));
        assert_eq!(redirected.to_string(), "relay.internal:8443");
    }
}
