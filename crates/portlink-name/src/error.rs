/// Errors that can occur in name-service operations.
///
/// Note that *failed resolution* is not an error: `query_name` answers
/// with an invalid [`crate::Contact`] when a name is unknown. Errors here
/// are about the exchange itself (I/O, malformed responses, rejected
/// registrations).
#[derive(Debug, thiserror::Error)]
pub enum NameError {
    /// An I/O error occurred talking to the name server.
    #[error("name service I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The name server sent a malformed response.
    #[error("malformed name service response: {0}")]
    Json(#[from] serde_json::Error),

    /// The name server rejected the request.
    #[error("name service rejected request: {0}")]
    Rejected(String),

    /// A registration was attempted with an unusable contact.
    #[error("cannot register invalid contact for '{0}'")]
    InvalidContact(String),
}

pub type Result<T> = std::result::Result<T, NameError>;
