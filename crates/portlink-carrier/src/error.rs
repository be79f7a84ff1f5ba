/// Errors that can occur during carrier negotiation and streaming.
#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] portlink_transport::TransportError),

    /// An I/O error occurred on the connection's stream.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A handshake step failed; the connection attempt is aborted.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// No registered carrier under this name.
    #[error("no carrier registered under name '{0}'")]
    UnknownCarrier(String),

    /// No registered carrier recognizes this 8-byte prologue.
    #[error("no carrier recognizes header {0:02x?}")]
    UnrecognizedHeader([u8; 8]),

    /// The peer closed the connection mid-exchange.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The peer violated the negotiated protocol; the connection is
    /// closed, never left half-synchronized.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A reply was requested on a carrier that does not support replies.
    #[error("carrier '{0}' does not support replies (try \"tcp\" or \"text_ack\")")]
    RepliesUnsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, CarrierError>;
