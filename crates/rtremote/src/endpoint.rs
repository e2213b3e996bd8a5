//! Socket endpoints
//!
//! Accepted spellings: `tcp://host:port`, `unix:///path/to/socket`, or a bare
//! `host:port` which is taken as TCP.

use crate::error::RemoteError;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

/// Local or remote address of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// IPv4/IPv6 TCP address
    Tcp(SocketAddr),
    /// Unix-domain socket path (empty for unnamed peers)
    Unix(PathBuf),
}

impl Endpoint {
    /// Whether this is a TCP endpoint.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp(_))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Tcp(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(RemoteError::Config(format!("empty unix socket path in '{}'", s)));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        addr.to_socket_addrs()
            .map_err(|e| RemoteError::Config(format!("invalid endpoint '{}': {}", s, e)))?
            .next()
            .map(Endpoint::Tcp)
            .ok_or_else(|| RemoteError::Config(format!("endpoint '{}' resolved to nothing", s)))
    }
}
