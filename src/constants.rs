//! Protocol constants and tuning parameters.
//!
//! Values the wire protocol fixes live next to the defaults of the peer and
//! pool configuration so both can be found in one place.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-BS0001-";

// ============================================================================
// Wire protocol
// ============================================================================

/// Protocol string sent in the handshake
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Handshake length: pstrlen + pstr + reserved + info hash + peer id
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Largest frame accepted from a peer (one block plus framing, with slack)
pub const MAX_MESSAGE_SIZE: usize = 130 * 1024;

/// Largest block a peer may request or cancel (128 KiB, BEP 3)
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

// ============================================================================
// Timers
// ============================================================================

/// Outbound idle time after which a keep-alive is sent
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Inactivity after which a read on the wire is abandoned
pub const READ_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// Time allowed for a single frame to be written
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP connect timeout for outbound peers
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Pool sizing
// ============================================================================

/// Peers we dial ourselves
pub const ACTIVE_PEERS: usize = 10;

/// Peers that dialled us
pub const INCOMING_PEERS: usize = 40;

/// Target size of the queue of tracker addresses not yet connected
pub const UNUSED_PEERS: usize = 50;

/// Below this fill percentage of [`UNUSED_PEERS`] the tracker is asked for more
pub const PERCENT_UNUSED_PEERS: usize = 20;

// ============================================================================
// Channel depths
// ============================================================================

/// Depth of a peer's control channel
pub const CONTROL_QUEUE_DEPTH: usize = 64;

/// Items a write queue holds before it stops taking commands
pub const WRITE_QUEUE_DEPTH: usize = 256;

/// Depth of the channel between a write queue and its writer
pub const WRITER_CHANNEL_DEPTH: usize = 1;

/// Depth of the pool's command and lifecycle channels
pub const POOL_QUEUE_DEPTH: usize = 128;
