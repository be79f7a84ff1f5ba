/// Behavior knobs shared by input and output ports.
#[derive(Debug, Clone)]
pub struct PortConfig {
    host: String,
    carrier: String,
    background_write: bool,
    strict: bool,
    queue_capacity: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            carrier: "tcp".to_string(),
            background_write: false,
            strict: false,
            queue_capacity: 64,
        }
    }
}

impl PortConfig {
    /// Host to bind the port's face on.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Default carrier for outgoing connections that do not name one.
    pub fn with_carrier(mut self, carrier: impl Into<String>) -> Self {
        self.carrier = carrier.into();
        self
    }

    /// Route writes through a background writer thread instead of the
    /// caller's thread.
    pub fn with_background_write(mut self, background: bool) -> Self {
        self.background_write = background;
        self
    }

    /// Strict input: keep every message in arrival order, applying
    /// backpressure when the queue fills. Non-strict (the default) keeps
    /// only the freshest message.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Capacity of the strict input queue.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    pub fn background_write(&self) -> bool {
        self.background_write
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}
