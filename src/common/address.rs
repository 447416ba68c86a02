//! Address type for network connections

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::Error;

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Canonical form: lowercase `host:port`
    pub fn canonical(&self) -> String {
        match self {
            Address::Socket(addr) => addr.to_string(),
            Address::Domain(domain, port) => format!("{}:{}", domain.to_lowercase(), port),
        }
    }

    /// Check if this is a domain address
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    /// Parse a `host:port` string, accepting both IP and domain hosts.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }
        if let Some((host, port)) = s.rsplit_once(':') {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::InvalidAddress(s.to_string()))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(Address::Socket(SocketAddr::new(ip, port)));
            }
            if host.is_empty() {
                return Err(Error::InvalidAddress(s.to_string()));
            }
            return Ok(Address::Domain(host.to_string(), port));
        }
        Err(Error::InvalidAddress(s.to_string()))
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

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Self {
        Address::Domain(domain, port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert!(Address::parse("127.0.0.1:80").unwrap().as_socket().is_some());
        assert_eq!(
            Address::parse("example.com:443").unwrap(),
            Address::domain("example.com", 443)
        );
        assert!(Address::parse("no-port").is_err());
        assert!(Address::parse(":80").is_err());
    }

    #[test]
    fn test_canonical_lowercases_domain() {
        assert_eq!(
            Address::domain("Example.COM", 443).canonical(),
            "example.com:443"
        );
    }
}
