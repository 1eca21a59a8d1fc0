use std::net::SocketAddr;

use super::peer_id::PeerId;

/// The connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// TCP connection in progress.
    Connecting,
    /// Connected, performing BitTorrent handshake.
    Handshaking,
    /// Fully connected and ready for data exchange.
    Connected,
    /// Connection has been closed.
    Disconnected,
}

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// The four choke/interest flags of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Mutable status shared by a peer's reader and writer.
///
/// The writer owns `am_*` flags, the reader owns `peer_*` flags; each side
/// only reads the other's.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerStatus {
    pub(crate) state: PeerState,
    pub(crate) choking: ChokingState,
    pub(crate) remote_id: Option<PeerId>,
    pub(crate) uploaded: u64,
    pub(crate) downloaded: u64,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            state: PeerState::Connecting,
            choking: ChokingState::default(),
            remote_id: None,
            uploaded: 0,
            downloaded: 0,
        }
    }
}

/// A point-in-time copy of a peer's status, as handed to the choke policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub direction: Direction,
    pub state: PeerState,
    pub choking: ChokingState,
    pub remote_id: Option<PeerId>,
    /// Block bytes sent to this peer.
    pub uploaded: u64,
    /// Block bytes received from this peer.
    pub downloaded: u64,
}
