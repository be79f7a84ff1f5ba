use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::carrier::Carrier;
use crate::carriers::local::{LocalCarrier, PipeRendezvous};
use crate::carriers::tcp::TcpCarrier;
use crate::carriers::text::TextCarrier;
use crate::error::{CarrierError, Result};

/// Registry of carrier prototypes, consulted by name when initiating and
/// by sniffed header when accepting.
///
/// Registration order matters: when headers could overlap, the first
/// registered carrier that recognizes a prologue wins, so more specific
/// carriers should be registered before catch-alls.
pub struct CarrierRegistry {
    prototypes: RwLock<Vec<Box<dyn Carrier>>>,
}

impl CarrierRegistry {
    /// An empty registry; useful for tests and restricted deployments.
    pub fn new() -> Self {
        Self {
            prototypes: RwLock::new(Vec::new()),
        }
    }

    /// A registry holding the built-in carriers, sharing one pipe
    /// rendezvous so `local` connections made through this registry can
    /// meet.
    pub fn with_defaults() -> Arc<Self> {
        let registry = Self::new();
        let rendezvous = PipeRendezvous::new();
        registry.register(Box::new(TcpCarrier::new()));
        registry.register(Box::new(TcpCarrier::fast()));
        registry.register(Box::new(TextCarrier::new()));
        registry.register(Box::new(TextCarrier::with_ack()));
        registry.register(Box::new(LocalCarrier::new(rendezvous)));
        Arc::new(registry)
    }

    pub fn register(&self, prototype: Box<dyn Carrier>) {
        debug!(carrier = prototype.name(), "registering carrier");
        let mut prototypes = match self.prototypes.write() {
            Ok(prototypes) => prototypes,
            Err(poisoned) => poisoned.into_inner(),
        };
        prototypes.push(prototype);
    }

    /// Clone a fresh per-connection carrier by name.
    pub fn find(&self, name: &str) -> Result<Box<dyn Carrier>> {
        let prototypes = match self.prototypes.read() {
            Ok(prototypes) => prototypes,
            Err(poisoned) => poisoned.into_inner(),
        };
        prototypes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.fresh())
            .ok_or_else(|| CarrierError::UnknownCarrier(name.to_string()))
    }

    /// Clone a fresh carrier for a sniffed 8-byte prologue, first match
    /// wins.
    pub fn sniff(&self, header: &[u8; 8]) -> Option<Box<dyn Carrier>> {
        let prototypes = match self.prototypes.read() {
            Ok(prototypes) => prototypes,
            Err(poisoned) => poisoned.into_inner(),
        };
        prototypes
            .iter()
            .find(|p| p.check_header(header))
            .map(|p| p.fresh())
    }

    /// Names of all registered carriers, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        let prototypes = match self.prototypes.read() {
            Ok(prototypes) => prototypes,
            Err(poisoned) => poisoned.into_inner(),
        };
        prototypes.iter().map(|p| p.name()).collect()
    }
}

impl Default for CarrierRegistry {
    fn default() -> Self {
        Self::new()
    }
}
