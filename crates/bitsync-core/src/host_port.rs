//! HostPort: the `(host, port)` identity of a peer endpoint.
//!
//! Used as the deduplication key when deciding whether we already know or
//! are already connected to a peer.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostPortError {
    #[error("Missing ':' separator in {0:?}")]
    MissingSeparator(String),
    #[error("Empty host in {0:?}")]
    EmptyHost(String),
    #[error("Invalid port in {0:?}")]
    InvalidPort(String),
}

/// Hostname and port of a peer endpoint.
///
/// Wire format: `{"host":"10.0.0.1","port":8111}`. Text format: `10.0.0.1:8111`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for HostPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = HostPortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // rsplit so IPv6 literals like [::1]:8111 keep their inner colons
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| HostPortError::MissingSeparator(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(HostPortError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| HostPortError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
