use crate::carrier::Carrier;

/// The default binary carrier over the initial TCP stream.
///
/// `tcp` acknowledges every message and supports replies; `fast_tcp`
/// skips both for lower latency on streams where loss of an occasional
/// message is acceptable to the receiver.
#[derive(Debug, Clone)]
pub struct TcpCarrier {
    ack: bool,
}

impl TcpCarrier {
    pub fn new() -> Self {
        Self { ack: true }
    }

    pub fn fast() -> Self {
        Self { ack: false }
    }
}

impl Default for TcpCarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Carrier for TcpCarrier {
    fn name(&self) -> &'static str {
        if self.ack {
            "tcp"
        } else {
            "fast_tcp"
        }
    }

    fn fresh(&self) -> Box<dyn Carrier> {
        Box::new(self.clone())
    }

    fn header(&self) -> [u8; 8] {
        if self.ack {
            *b"PLNKtcp\0"
        } else {
            *b"PLNKftcp"
        }
    }

    fn requires_ack(&self) -> bool {
        self.ack
    }

    fn supports_reply(&self) -> bool {
        self.ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_have_distinct_identities() {
        let tcp = TcpCarrier::new();
        let fast = TcpCarrier::fast();
        assert_eq!(tcp.name(), "tcp");
        assert_eq!(fast.name(), "fast_tcp");
        assert_ne!(tcp.header(), fast.header());
    }

    #[test]
    fn each_recognizes_only_its_own_header() {
        let tcp = TcpCarrier::new();
        assert!(tcp.check_header(b"PLNKtcp\0"));
        assert!(!tcp.check_header(b"PLNKftcp"));
        assert!(!tcp.check_header(b"CONNECT "));
    }

    #[test]
    fn fast_variant_drops_ack_and_reply() {
        let fast = TcpCarrier::fast();
        assert!(!fast.requires_ack());
        assert!(!fast.supports_reply());
        assert!(TcpCarrier::new().requires_ack());
        assert!(TcpCarrier::new().supports_reply());
    }
}
