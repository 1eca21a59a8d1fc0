use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("incoming peer limit reached")]
    CapacityExceeded,

    #[error("a peer from this address is already connected")]
    DuplicatePeer,

    #[error("address is already pooled or queued")]
    DuplicateCandidate,

    #[error("peer manager has shut down")]
    Shutdown,
}
