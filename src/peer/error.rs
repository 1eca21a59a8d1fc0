use thiserror::Error;

/// Errors that end a peer connection.
///
/// Every variant is fatal to the connection it occurred on; none are retried.
/// Reconnecting is left to the candidate queue, which may offer the address
/// again later.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O failed.
    #[error("wire error: {0}")]
    Wire(#[from] std::io::Error),

    /// The peer sent something that is not a handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The remote peer id is our own.
    #[error("connected to ourselves")]
    SelfConnection,

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read, write, or connect did not finish in time.
    #[error("timeout")]
    Timeout,

    /// A frame longer than the protocol allows.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// A malformed or out-of-sequence message.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A message id outside the base protocol.
    #[error("unknown message id: {0}")]
    UnknownMessage(u8),

    /// Both sides have every piece; nothing left to exchange.
    #[error("peer not useful")]
    PeerNotUseful,

    /// A bitfield payload of the wrong length or with spare bits set.
    #[error("invalid bitfield")]
    InvalidBitfield,

    /// An internal channel was closed under us.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}

impl PeerError {
    /// Whether the failure happened while establishing the connection.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            PeerError::InvalidHandshake | PeerError::InfoHashMismatch | PeerError::SelfConnection
        )
    }

    /// Whether the connection ended without either side misbehaving.
    pub fn is_graceful(&self) -> bool {
        matches!(self, PeerError::PeerNotUseful | PeerError::ConnectionClosed)
    }
}
