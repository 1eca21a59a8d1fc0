use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use super::piece::{Block, BlockRequest};
use crate::constants::{HANDSHAKE_LEN, PROTOCOL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            other => return Err(PeerError::UnknownMessage(other)),
        })
    }
}

/// The 68-byte opening exchange of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// A handshake advertising no extensions.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0; 8],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN
            || data[0] as usize != PROTOCOL.len()
            || &data[1..20] != PROTOCOL
        {
            return Err(PeerError::InvalidHandshake);
        }

        let mut handshake = Self::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&data[20..28]);
        handshake.info_hash.copy_from_slice(&data[28..48]);
        handshake.peer_id.copy_from_slice(&data[48..68]);
        Ok(handshake)
    }
}

/// A peer wire protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Port(u16),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request(_) => MessageId::Request,
            Message::Piece(_) => MessageId::Piece,
            Message::Cancel(_) => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
        })
    }

    /// Value of the frame's length prefix: id byte plus payload.
    pub fn body_len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request(_) | Message::Cancel(_) => 13,
            Message::Piece(block) => 9 + block.data.len(),
            Message::Port(_) => 3,
        }
    }

    /// Encodes the full frame including the length prefix.
    pub fn encode(&self) -> Bytes {
        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        if let Some(id) = self.id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece } => buf.put_u32(*piece),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request(req) | Message::Cancel(req) => {
                buf.put_u32(req.index);
                buf.put_u32(req.begin);
                buf.put_u32(req.length);
            }
            Message::Piece(block) => {
                buf.put_u32(block.index);
                buf.put_u32(block.begin);
                buf.put_slice(&block.data);
            }
            Message::Port(port) => buf.put_u16(*port),
            _ => {}
        }

        buf.freeze()
    }

    /// Decodes a frame body, i.e. everything after the length prefix.
    pub fn decode(mut body: Bytes) -> Result<Self, PeerError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(body.get_u8())?;
        let need = |len: usize, body: &Bytes| {
            if body.remaining() < len {
                Err(PeerError::ProtocolViolation(format!(
                    "{:?} payload of {} bytes, expected {}",
                    id,
                    body.remaining(),
                    len
                )))
            } else {
                Ok(())
            }
        };

        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                need(4, &body)?;
                Message::Have {
                    piece: body.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(body),
            MessageId::Request | MessageId::Cancel => {
                need(12, &body)?;
                let req = BlockRequest::new(body.get_u32(), body.get_u32(), body.get_u32());
                if id == MessageId::Request {
                    Message::Request(req)
                } else {
                    Message::Cancel(req)
                }
            }
            MessageId::Piece => {
                need(8, &body)?;
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece(Block::new(index, begin, body))
            }
            MessageId::Port => {
                need(2, &body)?;
                Message::Port(body.get_u16())
            }
        };

        Ok(message)
    }
}
