use super::message::Message;
use super::piece::BlockRequest;

/// An item on a peer's control channel.
///
/// Wire items end up on the network; internal items only steer the peer's
/// own write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Wire(Outbound),
    Internal(Internal),
}

impl PeerCommand {
    pub fn message(message: Message) -> Self {
        PeerCommand::Wire(Outbound::Message(message))
    }

    /// An upload of a block we hold; its data is read when it is sent.
    pub fn upload(request: BlockRequest) -> Self {
        PeerCommand::Wire(Outbound::Upload(request))
    }
}

/// Something the writer will put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(Message),
    /// A `piece` message known only by its header.
    Upload(BlockRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Internal {
    /// Drop every upload queued ahead of this command that has not reached
    /// the writer.
    Flush,
}
