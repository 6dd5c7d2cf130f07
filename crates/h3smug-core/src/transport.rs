//! The `Transport` trait: the interface the grammar engine drives, owned
//! here as an external collaborator contract. A real QUIC/H3 adapter ships
//! in the sibling `h3smug-transport` crate.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors a transport can surface. Anything other than `Timeout` is treated
/// as connection-fatal by the phase sequencer, which reconnects and resumes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying QUIC/H3 connection is gone and must be re-established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The peer's QPACK encoder stream signaled an error, typically because
    /// a header field exceeded a size limit the peer enforces.
    #[error("QPACK encoder stream error: {0}")]
    EncoderStreamError(String),
    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// Whether the underlying connection is still usable for another request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready to send another request.
    Open,
    /// Torn down; the caller must reconnect before sending again.
    Closed,
}

/// A response's ordered header list, with `:status` guaranteed first.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Ordered pseudo- and regular headers, `:status` first.
    pub headers: Vec<(Bytes, Bytes)>,
}

impl Response {
    /// Parse the leading `:status` pseudo-header as an HTTP status code.
    pub fn status(&self) -> Option<u16> {
        self.headers
            .first()
            .filter(|(name, _)| name.as_ref() == b":status")
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
            .and_then(|s| s.parse().ok())
    }
}

/// The interface the phase sequencer, length-bound search, and request
/// builder drive to exchange requests over HTTP/3. Not implemented in this
/// crate — see `h3smug-transport` for the `quinn` + `h3` adapter.
#[async_trait]
pub trait Transport {
    /// Send one request and await its response, bounded by an
    /// implementation-defined timeout. `Ok(None)` signals a timeout, not an
    /// error.
    async fn send(
        &mut self,
        headers: Vec<(Bytes, Bytes)>,
        body: Option<Bytes>,
    ) -> Result<Option<Response>, TransportError>;

    /// Whether the connection backing this transport is still usable.
    fn connection_state(&self) -> ConnectionState;
}
