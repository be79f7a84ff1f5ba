/// Errors surfaced by the port layer.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// Connection-level failure during negotiation or streaming.
    #[error("carrier error: {0}")]
    Carrier(#[from] portlink_carrier::CarrierError),

    /// Transport-level failure (bind, connect, accept).
    #[error("transport error: {0}")]
    Transport(#[from] portlink_transport::TransportError),

    /// Name registration or lookup failed.
    #[error("name error: {0}")]
    Name(#[from] portlink_name::NameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The target name did not resolve to a reachable contact.
    #[error("cannot resolve '{0}' to a contact")]
    ResolveFailed(String),

    /// A connection to this destination over this carrier already exists.
    #[error("already connected to '{0}'")]
    AlreadyConnected(String),

    /// No connection exists to this destination.
    #[error("no connection to '{0}'")]
    NoSuchConnection(String),

    /// A reply was requested but no connection supports replies.
    #[error("no connection on this port supports replies")]
    RepliesUnsupported,

    /// The port has been closed.
    #[error("port is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PortError>;
