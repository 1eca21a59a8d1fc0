use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::bitfield::{Bitfield, SharedBitfield};
use super::command::{Outbound, PeerCommand};
use super::error::PeerError;
use super::events::{PeerClosed, PieceEvent, StatEvent};
use super::message::Message;
use super::peer_id::PeerId;
use super::piece::{Block, BlockRequest};
use super::state::{Direction, PeerSnapshot, PeerState, PeerStatus};
use super::teardown::Teardown;
use super::transport::{PeerStream, Role, Wire, WireReader, WireWriter};
use super::write_queue::WriteQueue;
use crate::config::PeerConfig;
use crate::constants::{MAX_REQUEST_LENGTH, WRITER_CHANNEL_DEPTH};
use crate::storage::{self, FileRequest};

/// Everything a peer needs from the torrent it belongs to.
///
/// Cloned once per connection; the channels and the bitfield are shared by
/// every peer of the torrent.
#[derive(Clone)]
pub struct PeerContext {
    pub info_hash: [u8; 20],
    pub our_id: PeerId,
    pub piece_length: u64,
    /// The pieces we hold, updated by the piece manager.
    pub our_bitfield: SharedBitfield,
    pub config: PeerConfig,
    pub pieces: mpsc::Sender<PieceEvent>,
    pub stats: mpsc::Sender<StatEvent>,
    pub files: mpsc::Sender<FileRequest>,
    /// Where the pool hears that this peer has shut down.
    pub lifecycle: mpsc::Sender<PeerClosed>,
}

struct PeerShared {
    addr: SocketAddr,
    direction: Direction,
    ctx: PeerContext,
    control: mpsc::Sender<PeerCommand>,
    status: Mutex<PeerStatus>,
    shutdown: CancellationToken,
    teardown: Teardown,
}

impl PeerShared {
    fn set_state(&self, state: PeerState) {
        self.status.lock().state = state;
    }

    async fn close(&self, reason: Option<&PeerError>) {
        self.set_state(PeerState::Disconnected);
        self.teardown.run(reason).await;
    }

    async fn notify(&self, event: PieceEvent) -> Result<(), PeerError> {
        self.ctx
            .pieces
            .send(event)
            .await
            .map_err(|_| PeerError::ChannelClosed("piece manager"))
    }
}

/// A running peer connection.
///
/// The handle is the only way in: commands go through [`PeerHandle::send`]
/// and the connection reports back over the channels in its
/// [`PeerContext`]. Dropping every handle does not stop the peer; call
/// [`PeerHandle::shutdown`].
///
/// ```no_run
/// use bitswarm::peer::{Message, PeerCommand, PeerContext, PeerHandle};
/// # async fn example(ctx: PeerContext) -> Result<(), Box<dyn std::error::Error>> {
/// let peer = PeerHandle::connect("192.168.1.100:6881".parse()?, ctx);
/// peer.send(PeerCommand::message(Message::Unchoke)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    /// Dials `addr` and runs the connection as the handshake initiator.
    pub fn connect(addr: SocketAddr, ctx: PeerContext) -> Self {
        let (handle, task) = PeerTask::prepare(addr, Direction::Outbound, ctx);
        tokio::spawn(task.dial());
        handle
    }

    /// Runs an accepted connection as the handshake responder.
    pub fn accept<S: PeerStream>(stream: S, addr: SocketAddr, ctx: PeerContext) -> Self {
        let (handle, task) = PeerTask::prepare(addr, Direction::Inbound, ctx);
        tokio::spawn(task.run(stream, Role::Responder));
        handle
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Queues a command for the peer.
    ///
    /// Waits only for room on the control channel, never for the network.
    pub async fn send(&self, command: PeerCommand) -> Result<(), PeerError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PeerError::ChannelClosed("peer control"));
        }
        self.shared
            .control
            .send(command)
            .await
            .map_err(|_| PeerError::ChannelClosed("peer control"))
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let status = *self.shared.status.lock();
        PeerSnapshot {
            addr: self.shared.addr,
            direction: self.shared.direction,
            state: status.state,
            choking: status.choking,
            remote_id: status.remote_id,
            uploaded: status.uploaded,
            downloaded: status.downloaded,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Closes the connection.
    ///
    /// Safe to call any number of times, from any task; collaborators are
    /// notified once.
    pub async fn shutdown(&self) {
        self.shared.close(None).await;
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("addr", &self.shared.addr)
            .field("direction", &self.shared.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The connection before its stream exists: the write queue is already
/// running, the reader and writer are not.
struct PeerTask {
    shared: Arc<PeerShared>,
    outbound: mpsc::Receiver<Outbound>,
    cancels: mpsc::Sender<BlockRequest>,
}

impl PeerTask {
    fn prepare(addr: SocketAddr, direction: Direction, ctx: PeerContext) -> (PeerHandle, Self) {
        let depth = ctx.config.control_queue_depth;
        let write_depth = ctx.config.write_queue_depth;
        let (control_tx, control_rx) = mpsc::channel(depth);
        let (cancel_tx, cancel_rx) = mpsc::channel(depth);
        let (outbound_tx, outbound_rx) = mpsc::channel(WRITER_CHANNEL_DEPTH);
        let shutdown = CancellationToken::new();

        let teardown = Teardown::new(
            addr,
            shutdown.clone(),
            ctx.lifecycle.clone(),
            ctx.pieces.clone(),
            ctx.stats.clone(),
        );
        let shared = Arc::new(PeerShared {
            addr,
            direction,
            ctx,
            control: control_tx,
            status: Mutex::new(PeerStatus::default()),
            shutdown: shutdown.clone(),
            teardown,
        });

        let queue = WriteQueue::new(control_rx, cancel_rx, outbound_tx, write_depth, shutdown);
        tokio::spawn(queue.run());

        let handle = PeerHandle {
            shared: Arc::clone(&shared),
        };
        let task = Self {
            shared,
            outbound: outbound_rx,
            cancels: cancel_tx,
        };
        (handle, task)
    }

    async fn dial(self) {
        let shared = Arc::clone(&self.shared);
        let connect_timeout = shared.ctx.config.connect_timeout;

        let connected = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.close(None).await;
                return;
            }
            result = timeout(connect_timeout, TcpStream::connect(shared.addr)) => result,
        };

        match connected {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                self.run(stream, Role::Initiator).await;
            }
            Ok(Err(err)) => shared.close(Some(&PeerError::Wire(err))).await,
            Err(_) => shared.close(Some(&PeerError::Timeout)).await,
        }
    }

    async fn run<S: PeerStream>(self, stream: S, role: Role) {
        let shared = Arc::clone(&self.shared);
        let result = self.establish(stream, role).await;
        shared.close(result.as_ref().err()).await;
    }

    /// Handshakes, sends our bitfield, starts the reader and then becomes the
    /// writer.
    async fn establish<S: PeerStream>(self, stream: S, role: Role) -> Result<(), PeerError> {
        let shared = self.shared;
        shared.set_state(PeerState::Handshaking);

        let mut wire = Wire::new(stream, &shared.ctx.config);
        let remote_id = tokio::select! {
            _ = shared.shutdown.cancelled() => return Ok(()),
            result = wire.handshake(shared.ctx.info_hash, shared.ctx.our_id, role) => result?,
        };

        {
            let mut status = shared.status.lock();
            status.remote_id = Some(remote_id);
            status.state = PeerState::Connected;
        }
        debug!(addr = %shared.addr, peer_id = %remote_id, ?role, "handshake complete");

        let (reader, mut writer) = wire.split();
        writer
            .write_message(&Message::Bitfield(shared.ctx.our_bitfield.to_bytes()))
            .await?;

        let piece_count = shared.ctx.our_bitfield.piece_count();
        tokio::spawn(PeerReader::new(Arc::clone(&shared), reader, self.cancels, piece_count).run());

        PeerWriter::new(shared, writer, self.outbound).run().await
    }
}

/// Owns the sending half. Everything that reaches the wire passes through
/// here, one message at a time.
struct PeerWriter<W> {
    shared: Arc<PeerShared>,
    wire: WireWriter<W>,
    outbound: mpsc::Receiver<Outbound>,
    keep_alive: Interval,
}

impl<W: tokio::io::AsyncWrite + Unpin> PeerWriter<W> {
    fn new(
        shared: Arc<PeerShared>,
        wire: WireWriter<W>,
        outbound: mpsc::Receiver<Outbound>,
    ) -> Self {
        let period = shared.ctx.config.keep_alive_interval;
        let mut keep_alive = interval_at(Instant::now() + period, period);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            shared,
            wire,
            outbound,
            keep_alive,
        }
    }

    async fn run(mut self) -> Result<(), PeerError> {
        let shutdown = self.shared.shutdown.clone();

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                item = self.outbound.recv() => {
                    let Some(item) = item else { break Ok(()) };
                    if let Err(err) = self.transmit(item).await {
                        break Err(err);
                    }
                }
                _ = self.keep_alive.tick() => {
                    if let Err(err) = self.send(&Message::KeepAlive).await {
                        break Err(err);
                    }
                }
            }
        };

        self.wire.close().await;
        result
    }

    async fn transmit(&mut self, item: Outbound) -> Result<(), PeerError> {
        let message = match item {
            Outbound::Message(message) => {
                if !self.admit(&message) {
                    trace!(addr = %self.shared.addr, ?message, "redundant message suppressed");
                    return Ok(());
                }
                message
            }
            Outbound::Upload(request) => match self.hydrate(request).await {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        self.send(&message).await?;

        if let Message::Piece(block) = &message {
            let uploaded = block.data.len() as u64;
            self.shared.status.lock().uploaded += uploaded;
            let _ = self
                .shared
                .ctx
                .stats
                .send(StatEvent {
                    addr: self.shared.addr,
                    uploaded,
                    downloaded: 0,
                })
                .await;
        }
        Ok(())
    }

    /// Applies a choke or interest message to our side of the state.
    ///
    /// Returns false when the message would not change anything.
    fn admit(&self, message: &Message) -> bool {
        let mut status = self.shared.status.lock();
        let choking = &mut status.choking;
        match message {
            Message::Choke if choking.am_choking => false,
            Message::Choke => {
                choking.am_choking = true;
                true
            }
            Message::Unchoke if !choking.am_choking => false,
            Message::Unchoke => {
                choking.am_choking = false;
                true
            }
            Message::Interested if choking.am_interested => false,
            Message::Interested => {
                choking.am_interested = true;
                true
            }
            Message::NotInterested if !choking.am_interested => false,
            Message::NotInterested => {
                choking.am_interested = false;
                true
            }
            _ => true,
        }
    }

    /// Reads the data for an upload. `None` drops the upload.
    async fn hydrate(&mut self, request: BlockRequest) -> Option<Message> {
        let addr = self.shared.addr;
        let am_choking = self.shared.status.lock().choking.am_choking;
        if am_choking {
            trace!(%addr, ?request, "upload dropped, peer is choked");
            return None;
        }

        let offset = request.offset(self.shared.ctx.piece_length);
        match storage::read(&self.shared.ctx.files, offset, request.length as usize).await {
            Ok(data) => Some(Message::Piece(Block::new(request.index, request.begin, data))),
            Err(err) => {
                warn!(%addr, ?request, %err, "block read failed, upload dropped");
                None
            }
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        let written = self.wire.write_message(message).await?;
        self.keep_alive.reset();
        trace!(addr = %self.shared.addr, id = ?message.id(), written, "sent");
        Ok(())
    }
}

/// Owns the receiving half and everything we know about the remote's pieces.
struct PeerReader<R> {
    shared: Arc<PeerShared>,
    wire: WireReader<R>,
    cancels: mpsc::Sender<BlockRequest>,
    bitfield: Bitfield,
    /// The interest we last asked the writer to declare.
    interested: bool,
    /// Whether anything other than a keep-alive has arrived yet.
    seen_message: bool,
}

impl<R: tokio::io::AsyncRead + Unpin> PeerReader<R> {
    fn new(
        shared: Arc<PeerShared>,
        wire: WireReader<R>,
        cancels: mpsc::Sender<BlockRequest>,
        piece_count: usize,
    ) -> Self {
        Self {
            shared,
            wire,
            cancels,
            bitfield: Bitfield::new(piece_count),
            interested: false,
            seen_message: false,
        }
    }

    async fn run(mut self) {
        let shutdown = self.shared.shutdown.clone();

        let result = loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                message = self.wire.read_message() => message,
            };

            let handled = match message {
                Ok(message) => self.handle(message).await,
                Err(err) => Err(err),
            };
            if let Err(err) = handled {
                break Err(err);
            }
        };

        self.shared.close(result.as_ref().err()).await;
    }

    async fn handle(&mut self, message: Message) -> Result<(), PeerError> {
        let addr = self.shared.addr;
        trace!(%addr, id = ?message.id(), "received");

        let first = !self.seen_message && message != Message::KeepAlive;
        if message != Message::KeepAlive {
            self.seen_message = true;
        }

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                let was_choking = {
                    let mut status = self.shared.status.lock();
                    std::mem::replace(&mut status.choking.peer_choking, true)
                };
                if !was_choking {
                    self.shared.notify(PieceEvent::DiscardPeer { addr }).await?;
                }
            }
            Message::Unchoke => {
                self.shared.status.lock().choking.peer_choking = false;
                self.update_interest().await?;
                self.request_block().await?;
            }
            Message::Interested => {
                self.shared.status.lock().choking.peer_interested = true;
            }
            Message::NotInterested => {
                self.shared.status.lock().choking.peer_interested = false;
            }
            Message::Have { piece } => {
                let index = piece as usize;
                if index >= self.bitfield.piece_count() {
                    return Err(PeerError::ProtocolViolation(format!(
                        "have for piece {} of {}",
                        piece,
                        self.bitfield.piece_count()
                    )));
                }
                self.bitfield.set(index);
                self.availability_changed().await?;
            }
            Message::Bitfield(payload) => {
                if !first {
                    return Err(PeerError::ProtocolViolation(
                        "bitfield after the first message".into(),
                    ));
                }
                self.bitfield = Bitfield::from_payload(&payload, self.bitfield.piece_count())
                    .ok_or(PeerError::InvalidBitfield)?;
                self.availability_changed().await?;
            }
            Message::Request(request) => {
                check_length(&request)?;
                let am_choking = self.shared.status.lock().choking.am_choking;
                if am_choking {
                    trace!(%addr, ?request, "request from choked peer ignored");
                } else {
                    self.shared
                        .notify(PieceEvent::UploadRequest {
                            addr,
                            request,
                            reply: self.shared.control.clone(),
                        })
                        .await?;
                }
            }
            Message::Piece(block) => {
                let downloaded = block.data.len() as u64;
                self.shared.status.lock().downloaded += downloaded;
                let _ = self
                    .shared
                    .ctx
                    .stats
                    .send(StatEvent {
                        addr,
                        uploaded: 0,
                        downloaded,
                    })
                    .await;
                self.shared.notify(PieceEvent::BlockReceived { addr, block }).await?;
                self.update_interest().await?;
                self.request_block().await?;
            }
            Message::Cancel(request) => {
                check_length(&request)?;
                let _ = self.cancels.send(request).await;
            }
            Message::Port(port) => {
                trace!(%addr, port, "dht port ignored");
            }
        }
        Ok(())
    }

    async fn availability_changed(&mut self) -> Result<(), PeerError> {
        if self.shared.ctx.our_bitfield.is_complete() && self.bitfield.is_complete() {
            return Err(PeerError::PeerNotUseful);
        }
        self.update_interest().await?;
        self.request_block().await
    }

    /// Declares interest or its withdrawal when it changes.
    async fn update_interest(&mut self) -> Result<(), PeerError> {
        let wanted = self.shared.ctx.our_bitfield.lacks_any_of(&self.bitfield);
        if wanted == self.interested {
            return Ok(());
        }

        self.interested = wanted;
        let message = if wanted {
            Message::Interested
        } else {
            Message::NotInterested
        };
        self.shared
            .control
            .send(PeerCommand::message(message))
            .await
            .map_err(|_| PeerError::ChannelClosed("peer control"))
    }

    /// Asks the piece manager for work when the peer would serve it.
    async fn request_block(&mut self) -> Result<(), PeerError> {
        let peer_choking = self.shared.status.lock().choking.peer_choking;
        if !self.interested || peer_choking || self.shared.ctx.our_bitfield.is_complete() {
            return Ok(());
        }

        self.shared
            .notify(PieceEvent::NextBlock {
                addr: self.shared.addr,
                bitfield: self.bitfield.clone(),
                reply: self.shared.control.clone(),
            })
            .await
    }
}

fn check_length(request: &BlockRequest) -> Result<(), PeerError> {
    if request.length > MAX_REQUEST_LENGTH {
        return Err(PeerError::ProtocolViolation(format!(
            "block of {} bytes requested, limit is {}",
            request.length, MAX_REQUEST_LENGTH
        )));
    }
    Ok(())
}
