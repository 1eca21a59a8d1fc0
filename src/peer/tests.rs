use super::*;
use crate::config::PeerConfig;
use crate::constants::{HANDSHAKE_LEN, MAX_MESSAGE_SIZE, MAX_REQUEST_LENGTH};
use crate::storage::{FileRequest, StorageError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const INFO_HASH: [u8; 20] = [7; 20];
const PIECES: usize = 8;
const PIECE_LENGTH: u64 = 4;

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1, id2);
    assert_eq!(id1.client(), Some("BS0001"));
}

#[test]
fn test_bitfield() {
    let mut bf = Bitfield::new(10);
    assert!(bf.is_empty());

    bf.set(0);
    bf.set(9);
    bf.set(10);
    assert!(bf.has(0));
    assert!(bf.has(9));
    assert!(!bf.has(10));
    assert_eq!(bf.count(), 2);
    assert_eq!(bf.as_bytes(), &[0x80, 0x40]);
}

#[test]
fn test_bitfield_from_payload() {
    let bf = Bitfield::from_payload(&[0xA0, 0x80], 9).unwrap();
    assert!(bf.has(0));
    assert!(!bf.has(1));
    assert!(bf.has(2));
    assert!(bf.has(8));

    // wrong length
    assert!(Bitfield::from_payload(&[0xFF], 9).is_none());
    // spare bit set past piece 8
    assert!(Bitfield::from_payload(&[0xFF, 0xC0], 9).is_none());
}

#[test]
fn test_bitfield_full_and_lacks() {
    let full = Bitfield::full(9);
    assert!(full.is_complete());
    assert_eq!(full.as_bytes(), &[0xFF, 0x80]);

    let mut ours = Bitfield::new(9);
    assert!(ours.lacks_any_of(&full));
    for i in 0..9 {
        ours.set(i);
    }
    assert!(!ours.lacks_any_of(&full));
    assert!(!ours.lacks_any_of(&Bitfield::new(9)));
}

#[test]
fn test_handshake_encode_decode() {
    let handshake = Handshake::new([1u8; 20], [2u8; 20]);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded, handshake);
    assert_eq!(decoded.reserved, [0u8; 8]);

    let mut bad = encoded.to_vec();
    bad[1] = b'b';
    assert!(matches!(
        Handshake::decode(&bad),
        Err(PeerError::InvalidHandshake)
    ));
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xF0])),
        Message::Request(BlockRequest::new(1, 16384, 16384)),
        Message::Piece(Block::new(1, 0, Bytes::from_static(b"data"))),
        Message::Cancel(BlockRequest::new(1, 16384, 16384)),
        Message::Port(6881),
    ];

    for msg in messages {
        let frame = msg.encode();
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(length, msg.body_len());
        assert_eq!(Message::decode(frame.slice(4..)).unwrap(), msg);
    }
}

#[test]
fn test_message_decode_errors() {
    assert!(matches!(
        Message::decode(Bytes::from_static(&[42])),
        Err(PeerError::UnknownMessage(42))
    ));
    assert!(matches!(
        Message::decode(Bytes::from_static(&[4, 0, 1])),
        Err(PeerError::ProtocolViolation(_))
    ));
    assert!(matches!(
        Message::decode(Bytes::from_static(&[6, 0, 0, 0, 1])),
        Err(PeerError::ProtocolViolation(_))
    ));
}

#[test]
fn test_block_request_offset() {
    let request = BlockRequest::new(3, 100, 16384);
    assert_eq!(request.offset(1024), 3 * 1024 + 100);

    let block = Block::new(3, 100, Bytes::from_static(b"abc"));
    assert_eq!(block.request(), BlockRequest::new(3, 100, 3));
}

#[test]
fn test_choking_state_default() {
    let state = ChokingState::default();
    assert!(state.am_choking);
    assert!(!state.am_interested);
    assert!(state.peer_choking);
    assert!(!state.peer_interested);
}

#[test]
fn test_error_classification() {
    assert!(PeerError::InfoHashMismatch.is_handshake());
    assert!(!PeerError::Timeout.is_handshake());
    assert!(PeerError::PeerNotUseful.is_graceful());
    assert!(PeerError::ConnectionClosed.is_graceful());
    assert!(!PeerError::UnknownMessage(42).is_graceful());
}

#[tokio::test]
async fn test_wire_handshake() {
    let (a, b) = tokio::io::duplex(1024);
    let config = PeerConfig::default();
    let id_a = PeerId([1; 20]);
    let id_b = PeerId([2; 20]);

    let mut wire_a = Wire::new(a, &config);
    let mut wire_b = Wire::new(b, &config);
    let (seen_by_a, seen_by_b) = tokio::join!(
        wire_a.handshake(INFO_HASH, id_a, Role::Initiator),
        wire_b.handshake(INFO_HASH, id_b, Role::Responder),
    );
    assert_eq!(seen_by_a.unwrap(), id_b);
    assert_eq!(seen_by_b.unwrap(), id_a);

    let (mut reader, _) = wire_b.split();
    let (_, mut writer) = wire_a.split();
    let written = writer.write_message(&Message::Have { piece: 9 }).await.unwrap();
    assert_eq!(written, 9);
    assert_eq!(reader.read_message().await.unwrap(), Message::Have { piece: 9 });
}

#[tokio::test]
async fn test_wire_handshake_rejects_info_hash() {
    let (a, b) = tokio::io::duplex(1024);
    let config = PeerConfig::default();

    let responder = tokio::spawn({
        let config = config.clone();
        async move {
            let mut wire = Wire::new(b, &config);
            wire.handshake([8; 20], PeerId([2; 20]), Role::Responder).await
        }
    });

    let mut wire = Wire::new(a, &config);
    let result = wire.handshake(INFO_HASH, PeerId([1; 20]), Role::Initiator).await;

    // The responder never answers a torrent it does not serve.
    assert!(matches!(result, Err(PeerError::ConnectionClosed)));
    assert!(matches!(
        responder.await.unwrap(),
        Err(PeerError::InfoHashMismatch)
    ));
}

#[tokio::test]
async fn test_wire_handshake_rejects_self() {
    let (a, b) = tokio::io::duplex(1024);
    let config = PeerConfig::default();
    let id = PeerId::generate();

    let mut wire_a = Wire::new(a, &config);
    let mut wire_b = Wire::new(b, &config);
    let (result_a, result_b) = tokio::join!(
        wire_a.handshake(INFO_HASH, id, Role::Initiator),
        wire_b.handshake(INFO_HASH, id, Role::Responder),
    );
    assert!(matches!(result_a, Err(PeerError::SelfConnection)));
    assert!(matches!(result_b, Err(PeerError::SelfConnection)));
}

#[tokio::test]
async fn test_wire_rejects_oversized_frame() {
    let (a, mut b) = tokio::io::duplex(1024);
    let config = PeerConfig::default();

    b.write_all(&Handshake::new(INFO_HASH, [2; 20]).encode())
        .await
        .unwrap();
    b.write_all(&((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes())
        .await
        .unwrap();

    let mut wire = Wire::new(a, &config);
    wire.handshake(INFO_HASH, PeerId([1; 20]), Role::Responder)
        .await
        .unwrap();
    let (mut reader, _writer) = wire.split();
    assert!(matches!(
        reader.read_message().await,
        Err(PeerError::MessageTooLarge(len)) if len == MAX_MESSAGE_SIZE + 1
    ));
}

fn remote_addr() -> SocketAddr {
    "10.0.0.2:6881".parse().unwrap()
}

fn payload(pieces: &[usize]) -> Bytes {
    let mut bf = Bitfield::new(PIECES);
    for &piece in pieces {
        bf.set(piece);
    }
    bf.to_bytes()
}

fn all_but(missing: usize) -> Bitfield {
    let mut bf = Bitfield::new(PIECES);
    for piece in (0..PIECES).filter(|&p| p != missing) {
        bf.set(piece);
    }
    bf
}

/// The far end of a connection, speaking raw frames.
struct Remote {
    stream: DuplexStream,
}

impl Remote {
    async fn send(&mut self, message: Message) {
        self.stream.write_all(&message.encode()).await.unwrap();
    }

    async fn send_raw(&mut self, frame: &[u8]) {
        self.stream.write_all(frame).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        let mut length = [0u8; 4];
        self.stream.read_exact(&mut length).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(length) as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        Message::decode(Bytes::from(body)).unwrap()
    }

    /// Drains the stream until the peer closes its side.
    async fn wait_closed(&mut self) {
        let mut buf = [0u8; 256];
        while let Ok(n) = self.stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    }
}

struct Harness {
    peer: PeerHandle,
    remote: Remote,
    our_bitfield: SharedBitfield,
    pieces: mpsc::Receiver<PieceEvent>,
    stats: mpsc::Receiver<StatEvent>,
    files: mpsc::Receiver<FileRequest>,
    lifecycle: mpsc::Receiver<PeerClosed>,
}

async fn connect(ours: Bitfield) -> Harness {
    connect_with(ours, PeerConfig::default()).await
}

/// Starts an inbound peer and completes the handshake from the remote side.
async fn connect_with(ours: Bitfield, config: PeerConfig) -> Harness {
    let (local, stream) = tokio::io::duplex(64 * 1024);
    let (pieces_tx, pieces) = mpsc::channel(64);
    let (stats_tx, stats) = mpsc::channel(64);
    let (files_tx, files) = mpsc::channel(8);
    let (lifecycle_tx, lifecycle) = mpsc::channel(8);
    let our_bitfield = SharedBitfield::new(ours);

    let ctx = PeerContext {
        info_hash: INFO_HASH,
        our_id: PeerId::generate(),
        piece_length: PIECE_LENGTH,
        our_bitfield: our_bitfield.clone(),
        config,
        pieces: pieces_tx,
        stats: stats_tx,
        files: files_tx,
        lifecycle: lifecycle_tx,
    };
    let peer = PeerHandle::accept(local, remote_addr(), ctx);

    let mut remote = Remote { stream };
    remote
        .send_raw(&Handshake::new(INFO_HASH, [9; 20]).encode())
        .await;
    let mut reply = [0u8; HANDSHAKE_LEN];
    remote.stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(Handshake::decode(&reply).unwrap().info_hash, INFO_HASH);

    // Our bitfield always comes first.
    assert_eq!(
        remote.recv().await,
        Message::Bitfield(our_bitfield.to_bytes())
    );

    Harness {
        peer,
        remote,
        our_bitfield,
        pieces,
        stats,
        files,
        lifecycle,
    }
}

fn event_kind(event: &PieceEvent) -> &'static str {
    match event {
        PieceEvent::NextBlock { .. } => "next",
        PieceEvent::BlockReceived { .. } => "block",
        PieceEvent::DiscardPeer { .. } => "discard",
        PieceEvent::UploadRequest { .. } => "upload",
    }
}

/// Checks the three teardown notifications arrived, once each.
async fn assert_closed_once(h: &mut Harness) {
    let addr = remote_addr();
    assert_eq!(h.lifecycle.recv().await, Some(PeerClosed { addr }));

    let mut discards = 0;
    while let Some(event) = h.pieces.recv().await {
        if let PieceEvent::DiscardPeer { addr: discarded } = event {
            assert_eq!(discarded, addr);
            discards += 1;
            break;
        }
    }
    assert_eq!(discards, 1);
    loop {
        let stat = h.stats.recv().await.unwrap();
        if stat == StatEvent::closing(addr) {
            break;
        }
    }

    // Later shutdowns only release, they do not notify again.
    h.peer.shutdown().await;
    h.peer.shutdown().await;
    assert!(h.peer.is_closed());
    assert!(h.lifecycle.try_recv().is_err());
    assert!(h.pieces.try_recv().is_err());
    assert!(h.stats.try_recv().is_err());
}

#[tokio::test]
async fn test_connected_snapshot() {
    let h = connect(Bitfield::new(PIECES)).await;

    let snapshot = h.peer.snapshot();
    assert_eq!(snapshot.addr, remote_addr());
    assert_eq!(snapshot.direction, Direction::Inbound);
    assert_eq!(snapshot.state, PeerState::Connected);
    assert_eq!(snapshot.remote_id, Some(PeerId([9; 20])));
    assert_eq!(snapshot.choking, ChokingState::default());
}

#[tokio::test]
async fn test_interest_declared_once() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    h.remote.send(Message::Bitfield(payload(&[0]))).await;
    h.remote.send(Message::Have { piece: 1 }).await;
    h.remote.send(Message::Unchoke).await;

    let reply = match h.pieces.recv().await.unwrap() {
        PieceEvent::NextBlock {
            addr,
            bitfield,
            reply,
        } => {
            assert_eq!(addr, remote_addr());
            assert!(bitfield.has(0));
            assert!(bitfield.has(1));
            assert!(!bitfield.has(2));
            reply
        }
        other => panic!("unexpected event: {:?}", other),
    };

    let request = BlockRequest::new(0, 0, 4);
    reply
        .send(PeerCommand::message(Message::Request(request)))
        .await
        .unwrap();
    h.peer
        .send(PeerCommand::message(Message::Have { piece: 5 }))
        .await
        .unwrap();

    assert_eq!(h.remote.recv().await, Message::Interested);
    assert_eq!(h.remote.recv().await, Message::Request(request));
    assert_eq!(h.remote.recv().await, Message::Have { piece: 5 });

    let snapshot = h.peer.snapshot();
    assert!(snapshot.choking.am_interested);
    assert!(!snapshot.choking.peer_choking);
}

#[tokio::test]
async fn test_interest_withdrawn_when_nothing_left() {
    let mut h = connect(all_but(0)).await;

    h.remote.send(Message::Bitfield(payload(&[0, 3]))).await;
    assert_eq!(h.remote.recv().await, Message::Interested);

    // The piece arrived from someone else.
    h.our_bitfield.set(0);
    h.remote.send(Message::Have { piece: 5 }).await;
    assert_eq!(h.remote.recv().await, Message::NotInterested);
}

#[tokio::test]
async fn test_choke_discards_once() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    h.remote.send(Message::Bitfield(payload(&[0]))).await;
    h.remote.send(Message::Unchoke).await;
    h.remote.send(Message::Choke).await;
    h.remote.send(Message::Choke).await;
    h.remote.send(Message::Unchoke).await;

    let mut kinds = Vec::new();
    for _ in 0..3 {
        kinds.push(event_kind(&h.pieces.recv().await.unwrap()));
    }
    assert_eq!(kinds, ["next", "discard", "next"]);
    assert!(h.pieces.try_recv().is_err());
}

#[tokio::test]
async fn test_block_received() {
    let mut h = connect(Bitfield::new(PIECES)).await;
    let addr = remote_addr();

    h.remote.send(Message::Bitfield(payload(&[1]))).await;
    h.remote.send(Message::Unchoke).await;
    assert_eq!(event_kind(&h.pieces.recv().await.unwrap()), "next");

    let block = Block::new(1, 0, Bytes::from_static(b"wxyz"));
    h.remote.send(Message::Piece(block.clone())).await;

    assert_eq!(
        h.stats.recv().await.unwrap(),
        StatEvent {
            addr,
            uploaded: 0,
            downloaded: 4
        }
    );
    match h.pieces.recv().await.unwrap() {
        PieceEvent::BlockReceived { addr: from, block: got } => {
            assert_eq!(from, addr);
            assert_eq!(got, block);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // Still interested and unchoked, so it asks for more work.
    assert_eq!(event_kind(&h.pieces.recv().await.unwrap()), "next");
    assert_eq!(h.peer.snapshot().downloaded, 4);
}

#[tokio::test]
async fn test_upload_reads_from_file_store() {
    let mut h = connect(Bitfield::full(PIECES)).await;
    let addr = remote_addr();

    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Unchoke);

    let request = BlockRequest::new(2, 0, 4);
    h.remote.send(Message::Request(request)).await;

    let reply = match h.pieces.recv().await.unwrap() {
        PieceEvent::UploadRequest {
            addr: from,
            request: asked,
            reply,
        } => {
            assert_eq!(from, addr);
            assert_eq!(asked, request);
            reply
        }
        other => panic!("unexpected event: {:?}", other),
    };
    reply.send(PeerCommand::upload(request)).await.unwrap();

    match h.files.recv().await.unwrap() {
        FileRequest::Read {
            offset,
            length,
            reply,
        } => {
            assert_eq!(offset, 8);
            assert_eq!(length, 4);
            reply.send(Ok(Bytes::from_static(b"ABCD"))).unwrap();
        }
        other => panic!("unexpected file request: {:?}", other),
    }

    assert_eq!(
        h.remote.recv().await,
        Message::Piece(Block::new(2, 0, Bytes::from_static(b"ABCD")))
    );
    assert_eq!(
        h.stats.recv().await.unwrap(),
        StatEvent {
            addr,
            uploaded: 4,
            downloaded: 0
        }
    );
    assert_eq!(h.peer.snapshot().uploaded, 4);
}

#[tokio::test]
async fn test_file_store_error_drops_one_upload() {
    let mut h = connect(Bitfield::full(PIECES)).await;

    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Unchoke);

    h.peer
        .send(PeerCommand::upload(BlockRequest::new(0, 0, 4)))
        .await
        .unwrap();
    match h.files.recv().await.unwrap() {
        FileRequest::Read { reply, .. } => {
            let err = StorageError::Io(std::io::Error::other("disk gone"));
            reply.send(Err(err)).unwrap();
        }
        other => panic!("unexpected file request: {:?}", other),
    }

    h.peer
        .send(PeerCommand::message(Message::Have { piece: 3 }))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Have { piece: 3 });
    assert!(!h.peer.is_closed());
    assert!(h.lifecycle.try_recv().is_err());
}

#[tokio::test]
async fn test_upload_dropped_while_choking() {
    let mut h = connect(Bitfield::full(PIECES)).await;

    h.peer
        .send(PeerCommand::upload(BlockRequest::new(0, 0, 4)))
        .await
        .unwrap();
    h.peer
        .send(PeerCommand::message(Message::Have { piece: 1 }))
        .await
        .unwrap();

    assert_eq!(h.remote.recv().await, Message::Have { piece: 1 });
    assert!(h.files.try_recv().is_err());
}

#[tokio::test]
async fn test_request_ignored_while_choking() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    h.remote
        .send(Message::Request(BlockRequest::new(0, 0, 4)))
        .await;
    h.remote.send(Message::Have { piece: 1 }).await;

    assert_eq!(h.remote.recv().await, Message::Interested);
    assert!(h.pieces.try_recv().is_err());
}

#[tokio::test]
async fn test_redundant_choke_suppressed() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    // We start out choking, so this goes nowhere.
    h.peer
        .send(PeerCommand::message(Message::Choke))
        .await
        .unwrap();
    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    h.peer
        .send(PeerCommand::message(Message::Choke))
        .await
        .unwrap();

    assert_eq!(h.remote.recv().await, Message::Unchoke);
    assert_eq!(h.remote.recv().await, Message::Choke);
    assert!(h.peer.snapshot().choking.am_choking);
}

/// Answers a read and returns the offset it asked for.
fn answer(request: FileRequest, data: &'static [u8]) -> u64 {
    match request {
        FileRequest::Read { offset, reply, .. } => {
            reply.send(Ok(Bytes::from_static(data))).unwrap();
            offset
        }
        other => panic!("unexpected file request: {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_withdraws_queued_upload() {
    let mut h = connect(Bitfield::full(PIECES)).await;

    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Unchoke);

    // The writer holds `first` until its read is answered, so `second` and
    // `third` wait behind it.
    let first = BlockRequest::new(0, 0, 4);
    let second = BlockRequest::new(1, 0, 4);
    let third = BlockRequest::new(2, 0, 4);
    h.peer.send(PeerCommand::upload(first)).await.unwrap();
    let first_read = h.files.recv().await.unwrap();
    h.peer.send(PeerCommand::upload(second)).await.unwrap();
    h.peer.send(PeerCommand::upload(third)).await.unwrap();

    h.remote.send(Message::Cancel(third)).await;
    h.remote
        .send(Message::Request(BlockRequest::new(5, 0, 4)))
        .await;
    // The reader handed the cancel on before it saw the request.
    assert_eq!(event_kind(&h.pieces.recv().await.unwrap()), "upload");

    assert_eq!(answer(first_read, b"aaaa"), 0);
    assert_eq!(
        h.remote.recv().await,
        Message::Piece(Block::new(0, 0, Bytes::from_static(b"aaaa")))
    );
    assert_eq!(answer(h.files.recv().await.unwrap(), b"bbbb"), 4);
    assert_eq!(
        h.remote.recv().await,
        Message::Piece(Block::new(1, 0, Bytes::from_static(b"bbbb")))
    );

    h.peer
        .send(PeerCommand::message(Message::Have { piece: 7 }))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Have { piece: 7 });
    assert!(h.files.try_recv().is_err());
}

#[tokio::test]
async fn test_upload_after_choke_and_unchoke_is_sent() {
    let mut h = connect(Bitfield::full(PIECES)).await;

    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Unchoke);

    let request = BlockRequest::new(2, 0, 4);
    h.peer
        .send(PeerCommand::message(Message::Choke))
        .await
        .unwrap();
    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    h.peer.send(PeerCommand::upload(request)).await.unwrap();

    assert_eq!(h.remote.recv().await, Message::Choke);
    assert_eq!(h.remote.recv().await, Message::Unchoke);
    assert_eq!(answer(h.files.recv().await.unwrap(), b"ABCD"), 8);
    assert_eq!(
        h.remote.recv().await,
        Message::Piece(Block::new(2, 0, Bytes::from_static(b"ABCD")))
    );
}

/// Checks a close caused by the remote's own message: notified once, and
/// nothing reached the piece manager or the file store before the discard.
async fn assert_rejected(h: &mut Harness) {
    assert_eq!(
        h.lifecycle.recv().await,
        Some(PeerClosed {
            addr: remote_addr()
        })
    );
    assert_eq!(event_kind(&h.pieces.recv().await.unwrap()), "discard");
    assert!(h.files.try_recv().is_err());
    h.remote.wait_closed().await;
    assert_eq!(h.peer.snapshot().state, PeerState::Disconnected);
}

#[tokio::test]
async fn test_oversized_request_closes() {
    let mut h = connect(Bitfield::full(PIECES)).await;

    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Unchoke);

    h.remote
        .send(Message::Request(BlockRequest::new(0, 0, u32::MAX)))
        .await;

    assert_rejected(&mut h).await;
}

#[tokio::test]
async fn test_largest_request_is_forwarded() {
    let mut h = connect(Bitfield::full(PIECES)).await;

    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Unchoke);

    let request = BlockRequest::new(0, 0, MAX_REQUEST_LENGTH);
    h.remote.send(Message::Request(request)).await;

    match h.pieces.recv().await.unwrap() {
        PieceEvent::UploadRequest { request: asked, .. } => assert_eq!(asked, request),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(!h.peer.is_closed());
}

#[tokio::test]
async fn test_oversized_cancel_closes() {
    let mut h = connect(Bitfield::full(PIECES)).await;

    h.remote
        .send(Message::Cancel(BlockRequest::new(0, 0, MAX_REQUEST_LENGTH + 1)))
        .await;

    assert_rejected(&mut h).await;
}

#[tokio::test(start_paused = true)]
async fn test_full_write_queue_makes_send_wait() {
    let config = PeerConfig::default()
        .with_control_queue_depth(1)
        .with_write_queue_depth(2);
    let mut h = connect_with(Bitfield::full(PIECES), config).await;

    h.peer
        .send(PeerCommand::message(Message::Unchoke))
        .await
        .unwrap();
    assert_eq!(h.remote.recv().await, Message::Unchoke);

    // The writer waits on the first read; the second upload fills the writer
    // channel, two more fill the queue and one waits on the control channel.
    h.peer
        .send(PeerCommand::upload(BlockRequest::new(0, 0, 4)))
        .await
        .unwrap();
    let first_read = h.files.recv().await.unwrap();
    for piece in 1..5 {
        h.peer
            .send(PeerCommand::upload(BlockRequest::new(piece, 0, 4)))
            .await
            .unwrap();
    }

    let mut blocked = Box::pin(h.peer.send(PeerCommand::upload(BlockRequest::new(5, 0, 4))));
    assert!(tokio::time::timeout(Duration::from_secs(1), &mut blocked)
        .await
        .is_err());

    assert_eq!(answer(first_read, b"aaaa"), 0);
    blocked.await.unwrap();
    assert_eq!(
        h.remote.recv().await,
        Message::Piece(Block::new(0, 0, Bytes::from_static(b"aaaa")))
    );
    assert_eq!(answer(h.files.recv().await.unwrap(), b"bbbb"), 4);
}

#[tokio::test]
async fn test_mutually_complete_peer_closes() {
    let mut h = connect(Bitfield::full(PIECES)).await;

    h.remote
        .send(Message::Bitfield(Bitfield::full(PIECES).to_bytes()))
        .await;

    assert_closed_once(&mut h).await;
    h.remote.wait_closed().await;
    assert_eq!(h.peer.snapshot().state, PeerState::Disconnected);
}

#[tokio::test]
async fn test_unknown_message_closes_once() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    h.remote.send_raw(&[0, 0, 0, 1, 42]).await;

    assert_closed_once(&mut h).await;
    h.remote.wait_closed().await;
}

#[tokio::test]
async fn test_late_bitfield_closes() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    h.remote.send(Message::KeepAlive).await;
    h.remote.send(Message::Interested).await;
    h.remote.send(Message::Bitfield(payload(&[0]))).await;

    assert_closed_once(&mut h).await;
}

#[tokio::test]
async fn test_malformed_bitfield_closes() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    h.remote
        .send(Message::Bitfield(Bytes::from_static(&[0xFF, 0xFF])))
        .await;

    assert_closed_once(&mut h).await;
}

#[tokio::test]
async fn test_have_out_of_range_closes() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    h.remote
        .send(Message::Have {
            piece: PIECES as u32,
        })
        .await;

    assert_closed_once(&mut h).await;
}

#[tokio::test]
async fn test_remote_hangup_closes() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    h.remote.stream.shutdown().await.unwrap();

    assert_closed_once(&mut h).await;
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_after_idle() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    let started = tokio::time::Instant::now();
    assert_eq!(h.remote.recv().await, Message::KeepAlive);
    assert!(started.elapsed() >= crate::constants::KEEP_ALIVE_INTERVAL);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_shutdown_notifies_once() {
    let mut h = connect(Bitfield::new(PIECES)).await;

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let peer = h.peer.clone();
            tokio::spawn(async move { peer.shutdown().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    assert_closed_once(&mut h).await;
}

#[tokio::test]
async fn test_send_after_shutdown_fails() {
    let h = connect(Bitfield::new(PIECES)).await;

    h.peer.shutdown().await;
    assert!(matches!(
        h.peer
            .send(PeerCommand::message(Message::Unchoke))
            .await,
        Err(PeerError::ChannelClosed(_))
    ));
}

#[tokio::test]
async fn test_outbound_connect_failure_notifies() {
    // Bind then drop so nothing listens on the port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (pieces_tx, mut pieces) = mpsc::channel(8);
    let (stats_tx, mut stats) = mpsc::channel(8);
    let (files_tx, _files) = mpsc::channel(8);
    let (lifecycle_tx, mut lifecycle) = mpsc::channel(8);
    let ctx = PeerContext {
        info_hash: INFO_HASH,
        our_id: PeerId::generate(),
        piece_length: PIECE_LENGTH,
        our_bitfield: SharedBitfield::new(Bitfield::new(PIECES)),
        config: PeerConfig::default(),
        pieces: pieces_tx,
        stats: stats_tx,
        files: files_tx,
        lifecycle: lifecycle_tx,
    };

    let peer = PeerHandle::connect(addr, ctx);
    assert_eq!(peer.direction(), Direction::Outbound);
    assert_eq!(lifecycle.recv().await, Some(PeerClosed { addr }));
    assert!(matches!(
        pieces.recv().await,
        Some(PieceEvent::DiscardPeer { .. })
    ));
    assert_eq!(stats.recv().await, Some(StatEvent::closing(addr)));
}
