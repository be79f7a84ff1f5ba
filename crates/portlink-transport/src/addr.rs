use std::fmt;
use std::net::SocketAddr;

/// A transport-level address: host and port.
///
/// An address with an empty host or a zero port is invalid; invalid
/// addresses are used as "not known" placeholders rather than errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAddr {
    host: String,
    port: u16,
}

impl StreamAddr {
    /// Create an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The invalid placeholder address.
    pub fn invalid() -> Self {
        Self {
            host: String::new(),
            port: 0,
        }
    }

    /// True if both host and port are set.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for StreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "<invalid>")
        }
    }
}

impl From<SocketAddr> for StreamAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
