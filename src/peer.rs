//! One actor per peer connection (BEP-3).
//!
//! A connection is three tasks sharing an [`Arc`](std::sync::Arc)'d status
//! block:
//!
//! - a reader that decodes the remote's messages and drives the piece
//!   manager,
//! - a write queue that buffers outbound traffic and applies cancels,
//! - a writer that puts one message at a time on the wire, reading upload
//!   data from the file store just before it goes out.
//!
//! Outside code only sees a [`PeerHandle`]. Whichever task fails first tears
//! the connection down, and the pool, piece manager and stats aggregator
//! each hear about it exactly once.

mod bitfield;
mod command;
mod connection;
mod error;
mod events;
mod message;
mod peer_id;
mod piece;
mod state;
mod teardown;
mod transport;
mod write_queue;

pub use bitfield::{Bitfield, SharedBitfield};
pub use command::{Internal, Outbound, PeerCommand};
pub use connection::{PeerContext, PeerHandle};
pub use error::PeerError;
pub use events::{PeerClosed, PieceEvent, StatEvent};
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use piece::{Block, BlockRequest};
pub use state::{ChokingState, Direction, PeerSnapshot, PeerState};
pub use transport::{PeerStream, Role, Wire, WireReader, WireWriter};

#[cfg(test)]
mod tests;
