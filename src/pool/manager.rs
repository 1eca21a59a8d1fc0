use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::error::PoolError;
use crate::config::{ConfigError, PoolConfig};
use crate::peer::{
    Message, PeerClosed, PeerCommand, PeerContext, PeerHandle, PeerId, PeerSnapshot, PeerStream,
    PieceEvent, SharedBitfield, StatEvent,
};
use crate::storage::FileRequest;

/// Asks the tracker client for more peer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerRequest {
    pub count: usize,
}

/// The torrent the pool serves.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub info_hash: [u8; 20],
    pub our_id: PeerId,
    pub piece_length: u64,
    pub our_bitfield: SharedBitfield,
}

/// Channels to the collaborators every peer of the pool reports to.
#[derive(Debug, Clone)]
pub struct PoolLinks {
    pub pieces: mpsc::Sender<PieceEvent>,
    pub stats: mpsc::Sender<StatEvent>,
    pub files: mpsc::Sender<FileRequest>,
    pub tracker: mpsc::Sender<TrackerRequest>,
}

/// Pool sizes at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub active: usize,
    pub incoming: usize,
    pub candidates: usize,
}

enum PoolCommand {
    AddCandidates(Vec<SocketAddr>),
    Broadcast {
        message: Message,
        targets: Vec<SocketAddr>,
    },
    Accept {
        stream: Box<dyn PeerStream>,
        addr: SocketAddr,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Snapshot(oneshot::Sender<HashMap<SocketAddr, PeerSnapshot>>),
    Counts(oneshot::Sender<PoolCounts>),
}

/// A cloneable way in to a running [`PeerManager`].
#[derive(Debug, Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    /// Offers addresses from a tracker announce.
    pub async fn add_candidates(&self, addrs: Vec<SocketAddr>) -> Result<(), PoolError> {
        self.submit(PoolCommand::AddCandidates(addrs)).await
    }

    /// Sends `message` to the listed peers, or to every pooled peer when
    /// `targets` is empty.
    pub async fn broadcast(
        &self,
        message: Message,
        targets: Vec<SocketAddr>,
    ) -> Result<(), PoolError> {
        self.submit(PoolCommand::Broadcast { message, targets }).await
    }

    /// Hands over a connection accepted by the listener.
    ///
    /// A rejected stream is dropped, which closes it.
    pub async fn accept<S: PeerStream>(
        &self,
        stream: S,
        addr: SocketAddr,
    ) -> Result<(), PoolError> {
        let (reply, response) = oneshot::channel();
        self.submit(PoolCommand::Accept {
            stream: Box::new(stream),
            addr,
            reply,
        })
        .await?;
        response.await.map_err(|_| PoolError::Shutdown)?
    }

    /// Copies the status of every pooled peer.
    pub async fn snapshot(&self) -> Result<HashMap<SocketAddr, PeerSnapshot>, PoolError> {
        let (reply, response) = oneshot::channel();
        self.submit(PoolCommand::Snapshot(reply)).await?;
        response.await.map_err(|_| PoolError::Shutdown)
    }

    pub async fn counts(&self) -> Result<PoolCounts, PoolError> {
        let (reply, response) = oneshot::channel();
        self.submit(PoolCommand::Counts(reply)).await?;
        response.await.map_err(|_| PoolError::Shutdown)
    }

    async fn submit(&self, command: PoolCommand) -> Result<(), PoolError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PoolError::Shutdown)
    }
}

impl std::fmt::Debug for PoolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolCommand::AddCandidates(addrs) => {
                f.debug_tuple("AddCandidates").field(&addrs.len()).finish()
            }
            PoolCommand::Broadcast { message, targets } => f
                .debug_struct("Broadcast")
                .field("message", message)
                .field("targets", &targets.len())
                .finish(),
            PoolCommand::Accept { addr, .. } => {
                f.debug_struct("Accept").field("addr", addr).finish()
            }
            PoolCommand::Snapshot(_) => f.write_str("Snapshot"),
            PoolCommand::Counts(_) => f.write_str("Counts"),
        }
    }
}

/// Owns the peers of one torrent.
///
/// # Examples
///
/// ```no_run
/// use bitswarm::config::PoolConfig;
/// use bitswarm::peer::{Bitfield, PeerId, SharedBitfield};
/// use bitswarm::pool::{PeerManager, PoolLinks, TorrentInfo};
/// use tokio::sync::mpsc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (pieces, _piece_events) = mpsc::channel(256);
/// let (stats, _stat_events) = mpsc::channel(256);
/// let (files, _file_requests) = mpsc::channel(64);
/// let (tracker, _tracker_requests) = mpsc::channel(8);
///
/// let torrent = TorrentInfo {
///     info_hash: [0u8; 20],
///     our_id: PeerId::generate(),
///     piece_length: 262_144,
///     our_bitfield: SharedBitfield::new(Bitfield::new(1200)),
/// };
/// let links = PoolLinks { pieces, stats, files, tracker };
///
/// let (manager, pool) = PeerManager::new(PoolConfig::default(), torrent, links)?;
/// tokio::spawn(manager.run());
///
/// pool.add_candidates(vec!["10.0.0.7:6881".parse()?]).await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerManager {
    config: PoolConfig,
    ctx: PeerContext,
    tracker: mpsc::Sender<TrackerRequest>,
    commands: mpsc::Receiver<PoolCommand>,
    lifecycle: mpsc::Receiver<PeerClosed>,
    active: HashMap<SocketAddr, PeerHandle>,
    incoming: HashMap<SocketAddr, PeerHandle>,
    candidates: VecDeque<SocketAddr>,
}

impl PeerManager {
    pub fn new(
        config: PoolConfig,
        torrent: TorrentInfo,
        links: PoolLinks,
    ) -> Result<(Self, PoolHandle), ConfigError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.queue_depth);
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(config.queue_depth);

        let ctx = PeerContext {
            info_hash: torrent.info_hash,
            our_id: torrent.our_id,
            piece_length: torrent.piece_length,
            our_bitfield: torrent.our_bitfield,
            config: config.peer.clone(),
            pieces: links.pieces,
            stats: links.stats,
            files: links.files,
            lifecycle: lifecycle_tx,
        };

        let manager = Self {
            active: HashMap::with_capacity(config.max_active_peers),
            incoming: HashMap::with_capacity(config.max_incoming_peers),
            candidates: VecDeque::new(),
            config,
            ctx,
            tracker: links.tracker,
            commands: command_rx,
            lifecycle: lifecycle_rx,
        };
        let handle = PoolHandle {
            commands: command_tx,
        };
        Ok((manager, handle))
    }

    /// Runs until every [`PoolHandle`] is dropped, then closes all peers.
    pub async fn run(mut self) {
        debug!(
            max_active = self.config.max_active_peers,
            max_incoming = self.config.max_incoming_peers,
            "peer manager started"
        );

        loop {
            tokio::select! {
                biased;
                Some(PeerClosed { addr }) = self.lifecycle.recv() => self.remove(addr),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, command: PoolCommand) {
        trace!(?command, "pool command");
        match command {
            PoolCommand::AddCandidates(addrs) => self.add_candidates(addrs),
            PoolCommand::Broadcast { message, targets } => self.broadcast(message, targets).await,
            PoolCommand::Accept {
                stream,
                addr,
                reply,
            } => {
                let result = self.accept(stream, addr);
                if let Err(err) = result {
                    debug!(%addr, %err, "inbound peer rejected");
                }
                let _ = reply.send(result);
            }
            PoolCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::Counts(reply) => {
                let _ = reply.send(self.counts());
            }
        }
    }

    fn add_candidates(&mut self, addrs: Vec<SocketAddr>) {
        let offered = addrs.len();
        for addr in addrs {
            if let Err(err) = self.admit_candidate(addr) {
                trace!(%addr, %err, "candidate skipped");
            }
        }
        debug!(
            offered,
            active = self.active.len(),
            candidates = self.candidates.len(),
            "tracker results admitted"
        );
    }

    fn admit_candidate(&mut self, addr: SocketAddr) -> Result<(), PoolError> {
        if self.is_pooled(&addr) || self.candidates.contains(&addr) {
            return Err(PoolError::DuplicateCandidate);
        }

        if self.active.len() < self.config.max_active_peers {
            self.connect(addr);
        } else {
            self.candidates.push_back(addr);
        }
        Ok(())
    }

    fn accept(&mut self, stream: Box<dyn PeerStream>, addr: SocketAddr) -> Result<(), PoolError> {
        if self.incoming.len() >= self.config.max_incoming_peers {
            return Err(PoolError::CapacityExceeded);
        }

        let ip = addr.ip();
        if self
            .active
            .keys()
            .chain(self.incoming.keys())
            .any(|pooled| pooled.ip() == ip)
        {
            return Err(PoolError::DuplicatePeer);
        }

        self.candidates.retain(|candidate| *candidate != addr);
        let peer = PeerHandle::accept(stream, addr, self.ctx.clone());
        self.incoming.insert(addr, peer);
        debug!(%addr, incoming = self.incoming.len(), "inbound peer added");
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr) {
        let peer = PeerHandle::connect(addr, self.ctx.clone());
        self.active.insert(addr, peer);
        debug!(%addr, active = self.active.len(), "outbound peer added");
    }

    fn remove(&mut self, addr: SocketAddr) {
        if self.active.remove(&addr).is_some() {
            debug!(%addr, active = self.active.len(), "outbound peer removed");
            self.replenish();
        } else if self.incoming.remove(&addr).is_some() {
            debug!(%addr, incoming = self.incoming.len(), "inbound peer removed");
        }
    }

    /// Fills a freed outbound slot from the candidate queue.
    fn replenish(&mut self) {
        while let Some(addr) = self.candidates.pop_front() {
            if self.is_pooled(&addr) {
                continue;
            }

            self.connect(addr);

            let target = self.config.candidate_target;
            if self.candidates.len() * 100 < target * self.config.candidate_low_water_percent {
                self.request_candidates(target.saturating_sub(self.candidates.len()));
            }
            return;
        }

        let deficit = self
            .config
            .max_active_peers
            .saturating_sub(self.active.len());
        self.request_candidates(self.config.candidate_target + deficit);
    }

    fn request_candidates(&self, count: usize) {
        if count == 0 {
            return;
        }

        match self.tracker.try_send(TrackerRequest { count }) {
            Ok(()) => debug!(count, "requested more peers from tracker"),
            Err(TrySendError::Full(_)) => warn!(count, "tracker request dropped, channel full"),
            Err(TrySendError::Closed(_)) => debug!(count, "tracker is gone"),
        }
    }

    async fn broadcast(&self, message: Message, targets: Vec<SocketAddr>) {
        let peers: Vec<PeerHandle> = if targets.is_empty() {
            self.active
                .values()
                .chain(self.incoming.values())
                .cloned()
                .collect()
        } else {
            targets
                .iter()
                .filter_map(|addr| self.active.get(addr).or_else(|| self.incoming.get(addr)))
                .cloned()
                .collect()
        };

        trace!(?message, peers = peers.len(), "broadcasting");
        for peer in peers {
            if let Err(err) = peer.send(PeerCommand::message(message.clone())).await {
                trace!(addr = %peer.addr(), %err, "broadcast to closing peer skipped");
            }
        }
    }

    fn snapshot(&self) -> HashMap<SocketAddr, PeerSnapshot> {
        self.active
            .iter()
            .chain(self.incoming.iter())
            .map(|(addr, peer)| (*addr, peer.snapshot()))
            .collect()
    }

    fn counts(&self) -> PoolCounts {
        PoolCounts {
            active: self.active.len(),
            incoming: self.incoming.len(),
            candidates: self.candidates.len(),
        }
    }

    fn is_pooled(&self, addr: &SocketAddr) -> bool {
        self.active.contains_key(addr) || self.incoming.contains_key(addr)
    }

    async fn shutdown(mut self) {
        // Nothing reads lifecycle events from here on.
        self.lifecycle.close();

        let peers: Vec<PeerHandle> = self
            .active
            .drain()
            .chain(self.incoming.drain())
            .map(|(_, peer)| peer)
            .collect();
        for peer in &peers {
            peer.shutdown().await;
        }
        debug!(closed = peers.len(), "peer manager stopped");
    }
}
