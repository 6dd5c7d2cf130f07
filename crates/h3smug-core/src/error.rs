//! Error types for the h3smug grammar engine

/// Result type alias for h3smug-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for h3smug
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The grammar document referenced an unknown symbol, mutation, or char-table
    #[error("grammar reference error: {0}")]
    Reference(String),

    /// A probability-sum or shape invariant on the grammar document did not hold
    #[error("grammar validation error: {0}")]
    Validation(String),

    /// The grammar document used an unknown top-level key or malformed shape
    #[error("grammar config error: {0}")]
    Config(String),

    /// Failure to read or parse the grammar JSON file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure to parse the grammar JSON file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The proxy answered with 200 OK but the origin never recorded the request
    #[error("contract violation: proxy returned 200 OK but origin did not echo the request")]
    ContractViolation,

    /// The transport reported a recoverable or fatal transmission failure;
    /// the phase sequencer decides whether to reconnect or abort.
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// An internal invariant was violated — indicates a bug, not bad input
    #[error("internal error: {0}")]
    Internal(String),
}
