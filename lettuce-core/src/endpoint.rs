//! Endpoint addressing.
//!
//! Parses `tcp://host:port` (or bare `host:port`) into a socket address.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Transport endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP transport: `tcp://host:port`
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:5555`
    /// - `tcp://[::1]:5555` (IPv6)
    /// - `tcp://localhost:5555` (resolved, first address wins)
    /// - `127.0.0.1:5555`
    ///
    /// # Examples
    ///
    /// ```
    /// use lettuce_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
    /// assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:5555");
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Build an endpoint from an IP string and a port.
    pub fn from_ip_port(ip: &str, port: u16) -> Result<Self, EndpointError> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| EndpointError::InvalidTcpAddress(format!("{ip}:{port}")))?;
        Ok(Self::Tcp(SocketAddr::new(ip, port)))
    }

    pub const fn socket_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(addr) => *addr,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = match s.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some(_) => return Err(EndpointError::InvalidScheme(s.to_string())),
            None => s,
        };

        if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
            return Ok(Self::Tcp(socket_addr));
        }

        addr.to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(Self::Tcp)
            .ok_or_else(|| EndpointError::InvalidTcpAddress(addr.to_string()))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Errors that can occur when parsing endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp://)")]
    InvalidScheme(String),

    #[error("Invalid TCP address: {0}")]
    InvalidTcpAddress(String),
}
