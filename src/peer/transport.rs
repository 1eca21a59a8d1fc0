use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use crate::config::PeerConfig;
use crate::constants::{HANDSHAKE_LEN, MAX_MESSAGE_SIZE};

/// Any byte stream a peer connection can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Which side of the handshake we play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialled: send our handshake first.
    Initiator,
    /// We accepted: wait for theirs first.
    Responder,
}

/// A framed connection before it is split between reader and writer.
pub struct Wire<S> {
    stream: S,
    read_buf: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    pub fn new(stream: S, config: &PeerConfig) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }

    /// Exchanges handshakes and returns the remote peer id.
    pub async fn handshake(
        &mut self,
        info_hash: [u8; 20],
        our_id: PeerId,
        role: Role,
    ) -> Result<PeerId, PeerError> {
        let ours = Handshake::new(info_hash, our_id.0);

        let theirs = match role {
            Role::Initiator => {
                self.send_handshake(&ours).await?;
                self.receive_handshake().await?
            }
            Role::Responder => {
                let theirs = self.receive_handshake().await?;
                if theirs.info_hash == info_hash {
                    self.send_handshake(&ours).await?;
                }
                theirs
            }
        };

        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        if theirs.peer_id == our_id.0 {
            return Err(PeerError::SelfConnection);
        }
        Ok(PeerId(theirs.peer_id))
    }

    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        timeout(self.write_timeout, self.stream.write_all(&handshake.encode()))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        fill(
            &mut self.stream,
            &mut self.read_buf,
            HANDSHAKE_LEN,
            self.read_timeout,
        )
        .await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Splits the connection into independently owned halves.
    ///
    /// Bytes already buffered past the handshake stay with the reader.
    pub fn split(self) -> (WireReader<ReadHalf<S>>, WireWriter<WriteHalf<S>>) {
        let (read, write) = split(self.stream);
        (
            WireReader {
                inner: read,
                read_buf: self.read_buf,
                read_timeout: self.read_timeout,
            },
            WireWriter {
                inner: write,
                write_timeout: self.write_timeout,
            },
        )
    }
}

/// The receiving half of a connection.
pub struct WireReader<R> {
    inner: R,
    read_buf: BytesMut,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        fill(&mut self.inner, &mut self.read_buf, 4, self.read_timeout).await?;

        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::MessageTooLarge(length));
        }

        fill(
            &mut self.inner,
            &mut self.read_buf,
            4 + length,
            self.read_timeout,
        )
        .await?;

        let mut frame = self.read_buf.split_to(4 + length);
        let body = frame.split_off(4);
        Message::decode(body.freeze())
    }
}

/// The sending half of a connection.
pub struct WireWriter<W> {
    inner: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    /// Writes one frame and returns the number of bytes put on the wire.
    pub async fn write_message(&mut self, message: &Message) -> Result<usize, PeerError> {
        let data = message.encode();
        timeout(self.write_timeout, self.inner.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(data.len())
    }

    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

async fn fill<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut BytesMut,
    want: usize,
    read_timeout: Duration,
) -> Result<(), PeerError> {
    while buf.len() < want {
        let n = timeout(read_timeout, stream.read_buf(buf))
            .await
            .map_err(|_| PeerError::Timeout)??;

        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
    }
    Ok(())
}
