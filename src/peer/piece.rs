use bytes::Bytes;

/// A block range as carried by `request` and `cancel` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    /// Flat byte offset of this block within the torrent's data.
    pub fn offset(&self, piece_length: u64) -> u64 {
        self.index as u64 * piece_length + self.begin as u64
    }
}

/// Block data as carried by a `piece` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(index: u32, begin: u32, data: Bytes) -> Self {
        Self { index, begin, data }
    }

    /// The request this block answers.
    pub fn request(&self) -> BlockRequest {
        BlockRequest::new(self.index, self.begin, self.data.len() as u32)
    }
}
