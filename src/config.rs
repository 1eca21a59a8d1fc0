//! Peer and pool configuration.
//!
//! Defaults come from [`crate::constants`]. Every setter is a consuming
//! `with_*` builder so a config can be assembled in one expression and then
//! checked with [`PoolConfig::validate`].

use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    ACTIVE_PEERS, CONNECT_TIMEOUT, CONTROL_QUEUE_DEPTH, INCOMING_PEERS, KEEP_ALIVE_INTERVAL,
    PERCENT_UNUSED_PEERS, POOL_QUEUE_DEPTH, READ_TIMEOUT, UNUSED_PEERS, WRITE_QUEUE_DEPTH,
    WRITE_TIMEOUT,
};

/// A configuration value that cannot be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Settings for a single peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Outbound idle time before a keep-alive is sent.
    pub keep_alive_interval: Duration,
    /// TCP connect timeout for outbound peers.
    pub connect_timeout: Duration,
    /// Maximum wait for the next frame from the peer.
    pub read_timeout: Duration,
    /// Maximum time for one frame to be written.
    pub write_timeout: Duration,
    /// Depth of the peer's control channel.
    pub control_queue_depth: usize,
    /// Commands the write queue buffers before producers have to wait.
    pub write_queue_depth: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            control_queue_depth: CONTROL_QUEUE_DEPTH,
            write_queue_depth: WRITE_QUEUE_DEPTH,
        }
    }
}

impl PeerConfig {
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_control_queue_depth(mut self, depth: usize) -> Self {
        self.control_queue_depth = depth;
        self
    }

    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }
}

/// Settings for the peer pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of the pool of peers we dial.
    pub max_active_peers: usize,
    /// Capacity of the pool of peers that dialled us.
    pub max_incoming_peers: usize,
    /// Target length of the unused candidate queue.
    pub candidate_target: usize,
    /// Fill percentage of `candidate_target` below which a top-up is requested.
    pub candidate_low_water_percent: usize,
    /// Depth of the pool's command and lifecycle channels.
    pub queue_depth: usize,
    /// Settings applied to every peer the pool spawns.
    pub peer: PeerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active_peers: ACTIVE_PEERS,
            max_incoming_peers: INCOMING_PEERS,
            candidate_target: UNUSED_PEERS,
            candidate_low_water_percent: PERCENT_UNUSED_PEERS,
            queue_depth: POOL_QUEUE_DEPTH,
            peer: PeerConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_max_active_peers(mut self, max: usize) -> Self {
        self.max_active_peers = max;
        self
    }

    pub fn with_max_incoming_peers(mut self, max: usize) -> Self {
        self.max_incoming_peers = max;
        self
    }

    pub fn with_candidate_target(mut self, target: usize) -> Self {
        self.candidate_target = target;
        self
    }

    pub fn with_peer_config(mut self, peer: PeerConfig) -> Self {
        self.peer = peer;
        self
    }

    /// Checks that the configuration describes a usable pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_peers == 0 {
            return Err(ConfigError::invalid("max_active_peers", "must be at least 1"));
        }
        if self.candidate_low_water_percent > 100 {
            return Err(ConfigError::invalid(
                "candidate_low_water_percent",
                format!("{} is not a percentage", self.candidate_low_water_percent),
            ));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::invalid("queue_depth", "must be at least 1"));
        }
        if self.peer.control_queue_depth == 0 {
            return Err(ConfigError::invalid(
                "peer.control_queue_depth",
                "must be at least 1",
            ));
        }
        if self.peer.write_queue_depth == 0 {
            return Err(ConfigError::invalid(
                "peer.write_queue_depth",
                "must be at least 1",
            ));
        }
        if self.peer.keep_alive_interval.is_zero() {
            return Err(ConfigError::invalid(
                "peer.keep_alive_interval",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}
