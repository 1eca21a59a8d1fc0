//! bitswarm - peer connections for a BitTorrent client
//!
//! This library runs the connections of one torrent: the per-peer protocol
//! state machine and the pool that decides which peers to talk to. Piece
//! selection, tracker announces and choking policy live elsewhere and plug in
//! through channels.
//!
//! # Modules
//!
//! - [`peer`] - BEP-3 peer wire protocol and the per-connection actor
//! - [`pool`] - Peer pool for a single torrent
//! - [`storage`] - Flat byte-range access to the torrent's files
//! - [`config`] - Tunables for peers and the pool
//! - [`constants`] - Protocol constants and defaults

pub mod config;
pub mod constants;
pub mod peer;
pub mod pool;
pub mod storage;

pub use config::{ConfigError, PeerConfig, PoolConfig};
pub use peer::{
    Bitfield, Block, BlockRequest, Direction, Message, PeerCommand, PeerContext, PeerError,
    PeerHandle, PeerId, PeerSnapshot, PeerState, PieceEvent, SharedBitfield, StatEvent,
};
pub use pool::{
    PeerManager, PoolCounts, PoolError, PoolHandle, PoolLinks, TorrentInfo, TrackerRequest,
};
pub use storage::{FileEntry, FileRequest, FileStore, FileWorker, StorageError};
