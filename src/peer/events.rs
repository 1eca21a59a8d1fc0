//! Messages a peer sends to the collaborators it shares with other peers.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use super::bitfield::Bitfield;
use super::command::PeerCommand;
use super::piece::{Block, BlockRequest};

/// Traffic from a peer to the piece manager.
#[derive(Debug)]
pub enum PieceEvent {
    /// Asks for the next block to request from this peer. An assignment comes
    /// back on `reply` as a `request` message.
    NextBlock {
        addr: SocketAddr,
        bitfield: Bitfield,
        reply: mpsc::Sender<PeerCommand>,
    },
    /// A block the peer sent us.
    BlockReceived { addr: SocketAddr, block: Block },
    /// Forget every outstanding request and assignment for this peer.
    DiscardPeer { addr: SocketAddr },
    /// The peer asked us for a block. An accepted upload comes back on
    /// `reply` as a header-only upload command.
    UploadRequest {
        addr: SocketAddr,
        request: BlockRequest,
        reply: mpsc::Sender<PeerCommand>,
    },
}

/// Transfer accounting for the stats aggregator.
///
/// A zero event marks the peer closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatEvent {
    pub addr: SocketAddr,
    pub uploaded: u64,
    pub downloaded: u64,
}

impl StatEvent {
    pub fn closing(addr: SocketAddr) -> Self {
        Self {
            addr,
            uploaded: 0,
            downloaded: 0,
        }
    }
}

/// Tells the pool a peer has shut down and should leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerClosed {
    pub addr: SocketAddr,
}
