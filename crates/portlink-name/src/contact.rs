use std::fmt;

use serde::{Deserialize, Serialize};

/// Where and how to reach a named endpoint.
///
/// Immutable value type; produced by name resolution, or constructed
/// directly for unregistered peer-to-peer use. The `with_*` constructors
/// return modified copies rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    name: String,
    host: String,
    port: u16,
    carrier: String,
}

impl Contact {
    /// The invalid placeholder contact ("cannot reach peer yet").
    pub fn invalid() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 0,
            carrier: String::new(),
        }
    }

    /// A contact known only by logical name, not yet resolved.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: String::new(),
            port: 0,
            carrier: String::new(),
        }
    }

    /// A contact known by network location.
    pub fn by_socket(host: impl Into<String>, port: u16) -> Self {
        Self {
            name: String::new(),
            host: host.into(),
            port,
            carrier: String::new(),
        }
    }

    /// Copy with the logical name replaced.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Copy with host and port replaced.
    pub fn with_socket(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Copy with the preferred carrier replaced.
    pub fn with_carrier(mut self, carrier: impl Into<String>) -> Self {
        self.carrier = carrier.into();
        self
    }

    /// True if this contact can actually be dialed.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "{} <unresolved>", self.name);
        }
        if self.carrier.is_empty() {
            write!(f, "{} @ {}:{}", self.name, self.host, self.port)
        } else {
            write!(
                f,
                "{} @ {}:{} ({})",
                self.name, self.host, self.port, self.carrier
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(!Contact::invalid().is_valid());
        assert!(!Contact::by_name("/robot/camera").is_valid());
        assert!(Contact::by_socket("127.0.0.1", 10002).is_valid());
        assert!(!Contact::by_socket("", 10002).is_valid());
        assert!(!Contact::by_socket("127.0.0.1", 0).is_valid());
    }

    #[test]
    fn builder_copies() {
        let c = Contact::by_name("/a")
            .with_socket("10.0.0.2", 9000)
            .with_carrier("text");
        assert_eq!(c.name(), "/a");
        assert_eq!(c.host(), "10.0.0.2");
        assert_eq!(c.port(), 9000);
        assert_eq!(c.carrier(), "text");
        assert!(c.is_valid());
    }

    #[test]
    fn serde_roundtrip() {
        let c = Contact::by_name("/b").with_socket("127.0.0.1", 7).with_carrier("tcp");
        let json = serde_json::to_string(&c).unwrap();
        let back: Contact = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn display_forms() {
        let c = Contact::by_name("/cam").with_socket("h", 1).with_carrier("tcp");
        assert_eq!(c.to_string(), "/cam @ h:1 (tcp)");
        assert_eq!(Contact::by_name("/cam").to_string(), "/cam <unresolved>");
    }
}
