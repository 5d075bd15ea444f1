//! Endpoint parsing and resolution

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

use super::{NetworkError, NetworkErrorKind, NetworkResult};

/// Endpoint errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("Invalid port: {0:?}")]
    InvalidPort(String),

    #[error("Missing port in {0:?}")]
    MissingPort(String),
}

/// A validated IP address and port. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    address: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Parse a textual address and port, as typed into a settings page
    pub fn parse(address: &str, port: &str) -> Result<Self, EndpointError> {
        let address = address
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| EndpointError::InvalidAddress(address.to_string()))?;
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
        Ok(Self { address, port })
    }

    /// Resolve a hostname to an endpoint
    pub async fn resolve(host: &str, port: u16) -> NetworkResult<Self> {
        if let Ok(address) = host.parse::<IpAddr>() {
            return Ok(Self::new(address, port));
        }

        let target = format!("{}:{}", host, port);
        let mut addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| NetworkError::io(NetworkErrorKind::Resolve, target.clone(), e))?;

        addrs.next().map(Self::from).ok_or_else(|| {
            NetworkError::new(
                NetworkErrorKind::Resolve,
                format!("Could not resolve host: {}", host),
            )
        })
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Same address, different port
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.address, port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.socket_addr()
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Parse `address:port`, with IPv6 addresses in brackets
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.trim().parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (address, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
        Self::parse(address.trim_start_matches('[').trim_end_matches(']'), port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_valid() {
        let endpoint = Endpoint::parse("192.168.1.20", "24810").unwrap();
        assert_eq!(endpoint.address(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(endpoint.port(), 24810);
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(
            Endpoint::parse("192.168.1", "80"),
            Err(EndpointError::InvalidAddress("192.168.1".to_string()))
        );
        assert_eq!(
            Endpoint::parse("10.0.0.1", "70000"),
            Err(EndpointError::InvalidPort("70000".to_string()))
        );
        assert!(Endpoint::parse("10.0.0.1", "").is_err());
    }

    #[test]
    fn test_from_str() {
        let endpoint: Endpoint = "10.0.0.5:1234".parse().unwrap();
        assert_eq!(endpoint.to_string(), "10.0.0.5:1234");

        let v6: Endpoint = "[::1]:80".parse().unwrap();
        assert_eq!(v6.port(), 80);

        assert!(matches!(
            "10.0.0.5".parse::<Endpoint>(),
            Err(EndpointError::MissingPort(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let endpoint = Endpoint::resolve("127.0.0.1", 5000).await.unwrap();
        assert_eq!(endpoint.socket_addr(), "127.0.0.1:5000".parse().unwrap());
    }
}
