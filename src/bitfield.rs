//! The piece availability bitmap, as exchanged with peers and kept for our
//! own download progress.

use bitvec::prelude::{BitVec, Msb0};

use crate::PieceIndex;

/// A compact bool vector recording piece availability.
///
/// The underlying representation is most-significant-bit first, matching the
/// wire format directly: the first (highest) bit of the first byte
/// represents piece 0, the second highest bit piece 1, and so on, e.g.
/// `0b1100_0001` means pieces 0, 1 and 7 are set.
#[derive(Clone, Debug, Default)]
pub struct Bitfield(BitVec<u8, Msb0>);

impl Bitfield {
    /// Creates a new bitfield with `piece_count` bits, all unset.
    pub fn new(piece_count: usize) -> Self {
        Self(BitVec::repeat(false, piece_count))
    }

    /// Creates a bitfield from its wire representation.
    ///
    /// The trailing bits in the last byte that don't correspond to an actual
    /// piece (because `piece_count` isn't a multiple of 8) are ignored by
    /// callers; this constructor doesn't strip them, it just exposes however
    /// many bits `bytes` encodes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(BitVec::from_vec(bytes.into()))
    }

    /// Returns the bitfield's wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_raw_slice()
    }

    /// Returns the number of pieces this bitfield can represent (including
    /// any padding bits in the last byte).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns whether the piece at `index` is set.
    ///
    /// Returns `false` and logs a warning for an out of range index, rather
    /// than panicking, since bitfields arrive over the wire from untrusted
    /// peers.
    pub fn has(&self, index: PieceIndex) -> bool {
        match self.0.get(index) {
            Some(bit) => *bit,
            None => {
                log::warn!(
                    "piece index {} out of range for bitfield of length {}",
                    index,
                    self.0.len()
                );
                false
            }
        }
    }

    /// Sets the piece at `index`. A no-op (with a warning logged) if `index`
    /// is out of range.
    pub fn set(&mut self, index: PieceIndex) {
        match self.0.get_mut(index) {
            Some(mut bit) => *bit = true,
            None => {
                log::warn!(
                    "piece index {} out of range for bitfield of length {}",
                    index,
                    self.0.len()
                );
            }
        }
    }

    /// Returns whether every bit (up to `piece_count`) is set, i.e. whether
    /// the torrent is complete.
    ///
    /// The trailing padding bits beyond `piece_count` (present in a wire
    /// bitfield that doesn't land on a byte boundary) must be zero for this
    /// to hold: a peer that sets them has no corresponding piece to claim.
    pub fn all_ones(&self, piece_count: usize) -> bool {
        self.0.iter().take(piece_count).all(|bit| *bit)
            && self.0.iter().skip(piece_count).all(|bit| !*bit)
    }

    /// Returns the number of set bits.
    pub fn count_ones(&self) -> usize {
        self.0.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut bf = Bitfield::new(10);
        assert!(!bf.has(0));
        bf.set(0);
        bf.set(7);
        assert!(bf.has(0));
        assert!(bf.has(7));
        assert!(!bf.has(1));
    }

    #[test]
    fn test_out_of_range_is_noop() {
        let mut bf = Bitfield::new(4);
        bf.set(100);
        assert!(!bf.has(100));
    }

    #[test]
    fn test_wire_layout_is_msb_first() {
        let mut bf = Bitfield::new(8);
        bf.set(0);
        bf.set(1);
        bf.set(7);
        assert_eq!(bf.as_bytes(), &[0b1100_0001]);
    }

    #[test]
    fn test_all_ones() {
        let mut bf = Bitfield::new(3);
        assert!(!bf.all_ones(3));
        bf.set(0);
        bf.set(1);
        bf.set(2);
        assert!(bf.all_ones(3));
    }

    #[test]
    fn test_all_ones_13_pieces_edge_bytes() {
        // piece_count = 13 => 2 bytes, 13 used bits, 3 padding bits in the
        // last byte
        assert!(Bitfield::from_bytes(vec![0xFF, 0xF8]).all_ones(13));
        assert!(!Bitfield::from_bytes(vec![0xFF, 0xF0]).all_ones(13));
        assert!(!Bitfield::from_bytes(vec![0xFE, 0xF8]).all_ones(13));
    }

    #[test]
    fn test_all_ones_rejects_set_padding_bits() {
        // all 13 real piece bits are set, but one of the 3 padding bits
        // (0xFC = 1111_1100) is also set, which doesn't correspond to any
        // piece and must not count as "complete"
        assert!(!Bitfield::from_bytes(vec![0xFF, 0xFC]).all_ones(13));
    }

    #[test]
    fn test_roundtrip_bytes() {
        let mut bf = Bitfield::new(16);
        bf.set(0);
        bf.set(15);
        let bytes = bf.as_bytes().to_vec();
        let bf2 = Bitfield::from_bytes(bytes);
        assert!(bf2.has(0));
        assert!(bf2.has(15));
        assert!(!bf2.has(1));
    }
}
