//! The set of peers for one torrent.
//!
//! A single [`PeerManager`] task owns every connection of the torrent. It
//! keeps up to `max_active_peers` outbound connections dialled from tracker
//! results, accepts up to `max_incoming_peers` connections from the listener,
//! and parks the addresses it has no room for until a slot frees up.
//!
//! Everything else talks to it through a cloneable [`PoolHandle`]:
//!
//! - the tracker client feeds it addresses and answers its
//!   [`TrackerRequest`]s,
//! - the listener hands it accepted streams,
//! - the piece manager broadcasts `have` messages,
//! - the choke policy takes snapshots and sends targeted chokes.
//!
//! The manager stops, closing every peer, when the last handle is dropped.

mod error;
mod manager;

pub use error::PoolError;
pub use manager::{PeerManager, PoolCounts, PoolHandle, PoolLinks, TorrentInfo, TrackerRequest};
