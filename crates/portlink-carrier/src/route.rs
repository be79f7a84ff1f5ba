/// Identity of one connection: source port name, destination port name,
/// and the carrier name chosen for it.
///
/// The route travels with the connection for its whole life and names it
/// in logs; the source may start out anonymous and be filled in once the
/// sender identifies itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    from: String,
    to: String,
    carrier: String,
}

impl Route {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        carrier: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            carrier: carrier.into(),
        }
    }

    pub fn from_name(&self) -> &str {
        &self.from
    }

    pub fn to_name(&self) -> &str {
        &self.to
    }

    pub fn carrier_name(&self) -> &str {
        &self.carrier
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    pub fn with_carrier(mut self, carrier: impl Into<String>) -> Self {
        self.carrier = carrier.into();
        self
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}->{}", self.from, self.carrier, self.to)
    }
}
