use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

/// A bitfield representing which pieces a side of a connection has.
///
/// Bits are numbered from the high bit of the first byte, as on the wire.
/// Spare bits in the last byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece present.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Parses a `bitfield` message payload.
    ///
    /// Returns `None` when the payload length does not match `piece_count` or
    /// any spare trailing bit is set.
    pub fn from_payload(payload: &[u8], piece_count: usize) -> Option<Self> {
        if payload.len() != piece_count.div_ceil(8) {
            return None;
        }
        let bf = Self {
            bits: payload.to_vec(),
            piece_count,
        };
        if bf.spare_mask() & bf.bits.last().copied().unwrap_or(0) != 0 {
            return None;
        }
        Some(bf)
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Marks a piece present. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Returns true if `theirs` has at least one piece this bitfield lacks.
    pub fn lacks_any_of(&self, theirs: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(&theirs.bits)
            .any(|(ours, theirs)| theirs & !ours != 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn spare_mask(&self) -> u8 {
        match self.piece_count % 8 {
            0 => 0,
            used => 0xFF >> used,
        }
    }

    fn clear_spare_bits(&mut self) {
        let mask = !self.spare_mask();
        if let Some(last) = self.bits.last_mut() {
            *last &= mask;
        }
    }
}

/// The session's own bitfield, shared with every peer.
///
/// The torrent session marks pieces as they are verified; peers only read.
#[derive(Debug, Clone)]
pub struct SharedBitfield(Arc<RwLock<Bitfield>>);

impl SharedBitfield {
    pub fn new(bitfield: Bitfield) -> Self {
        Self(Arc::new(RwLock::new(bitfield)))
    }

    /// Records a locally completed piece.
    pub fn set(&self, index: usize) {
        self.0.write().set(index);
    }

    pub fn is_complete(&self) -> bool {
        self.0.read().is_complete()
    }

    pub fn piece_count(&self) -> usize {
        self.0.read().piece_count()
    }

    /// Returns true if `theirs` has a piece we do not.
    pub fn lacks_any_of(&self, theirs: &Bitfield) -> bool {
        self.0.read().lacks_any_of(theirs)
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.read().to_bytes()
    }

    pub fn snapshot(&self) -> Bitfield {
        self.0.read().clone()
    }
}
