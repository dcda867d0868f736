//! Piece bitfields
//!
//! Wire-compatible bitfields with most-significant-bit-first ordering, used
//! for download progress, the global outstanding-request map, and per-peer
//! availability. A set-bit count is maintained alongside the bits so
//! completion checks stay cheap on large torrents.

use bitvec::prelude::*;

/// A fixed-length bitfield over piece (or block) indices.
///
/// Out-of-range reads return `false` and out-of-range writes are ignored.
/// During metadata bootstrap the piece count is provisional, so indices from
/// stale peer messages can legitimately exceed the current length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
    set_count: usize,
}

impl Bitfield {
    /// Create a bitfield of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 0; len],
            set_count: 0,
        }
    }

    /// Create a bitfield of `len` bits, all set.
    pub fn all_set(len: usize) -> Self {
        Self {
            bits: bitvec![u8, Msb0; 1; len],
            set_count: len,
        }
    }

    /// Parse a wire bitfield. `bytes` must hold exactly `len.div_ceil(8)`
    /// bytes and every spare bit in the final byte must be clear; anything
    /// else does not fit the piece count and parses as `None`.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Option<Self> {
        if bytes.len() != len.div_ceil(8) {
            return None;
        }
        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        if bits[len..].any() {
            return None;
        }
        bits.truncate(len);
        let set_count = bits.count_ones();
        Some(Self { bits, set_count })
    }

    /// Encode for the wire. Spare bits in the final byte are zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }

    /// Number of bits in the field.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.set_count
    }

    /// True when every bit is set.
    pub fn is_complete(&self) -> bool {
        self.set_count == self.bits.len()
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize) {
        if index < self.bits.len() && !self.bits[index] {
            self.bits.set(index, true);
            self.set_count += 1;
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.bits.len() && self.bits[index] {
            self.bits.set(index, false);
            self.set_count -= 1;
        }
    }

    /// First clear bit at or after `from`, if any.
    pub fn first_clear(&self, from: usize) -> Option<usize> {
        if from >= self.bits.len() {
            return None;
        }
        self.bits[from..].iter_zeros().next().map(|i| from + i)
    }

    /// First index at or after `from` that is clear here but set in `other`.
    ///
    /// This is the piece-selection primitive: `self` is the request (or
    /// progress) map and `other` is what a peer advertises.
    pub fn first_clear_matching_set(&self, other: &Bitfield, from: usize) -> Option<usize> {
        let end = self.bits.len().min(other.bits.len());
        (from..end).find(|&i| !self.bits[i] && other.bits[i])
    }

    /// First index in `range` that is clear here but set in `other`.
    pub fn first_clear_matching_set_in(
        &self,
        other: &Bitfield,
        range: std::ops::Range<usize>,
    ) -> Option<usize> {
        let end = range.end.min(self.bits.len()).min(other.bits.len());
        (range.start..end).find(|&i| !self.bits[i] && other.bits[i])
    }

    /// Grow or shrink to `new_len`, preserving bits below the boundary.
    ///
    /// Used when the real piece count replaces the provisional one after
    /// metadata completes.
    pub fn resize(&mut self, new_len: usize) {
        self.bits.resize(new_len, false);
        self.set_count = self.bits.count_ones();
    }

    /// Indices of all set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_count() {
        let mut bf = Bitfield::new(10);
        assert_eq!(bf.count_set(), 0);
        bf.set(3);
        bf.set(3);
        bf.set(9);
        assert_eq!(bf.count_set(), 2);
        assert!(bf.get(3));
        assert!(!bf.get(4));
        bf.clear(3);
        bf.clear(3);
        assert_eq!(bf.count_set(), 1);
    }

    #[test]
    fn test_out_of_range_is_silent() {
        let mut bf = Bitfield::new(4);
        bf.set(100);
        bf.clear(100);
        assert!(!bf.get(100));
        assert_eq!(bf.count_set(), 0);
    }

    #[test]
    fn test_wire_round_trip_msb_first() {
        let mut bf = Bitfield::new(11);
        bf.set(0);
        bf.set(8);
        let bytes = bf.to_bytes();
        // bit 0 is the high bit of byte 0, bit 8 the high bit of byte 1
        assert_eq!(bytes, vec![0b1000_0000, 0b1000_0000]);

        let parsed = Bitfield::from_bytes(&bytes, 11).unwrap();
        assert_eq!(parsed, bf);
    }

    #[test]
    fn test_from_bytes_rejects_short_buffer() {
        assert!(Bitfield::from_bytes(&[0xff], 9).is_none());
    }

    #[test]
    fn test_from_bytes_is_strict_about_fit() {
        // 0xff for 3 bits has spare bits set in the final byte
        assert!(Bitfield::from_bytes(&[0xff], 3).is_none());
        // a trailing extra byte is a length mismatch even when all zero
        assert!(Bitfield::from_bytes(&[0b1010_0000, 0x00], 3).is_none());

        let bf = Bitfield::from_bytes(&[0b1010_0000], 3).unwrap();
        assert_eq!(bf.count_set(), 2);
        assert_eq!(bf.len(), 3);
    }

    #[test]
    fn test_first_clear() {
        let mut bf = Bitfield::new(5);
        bf.set(0);
        bf.set(1);
        assert_eq!(bf.first_clear(0), Some(2));
        assert_eq!(bf.first_clear(3), Some(3));
        assert_eq!(bf.first_clear(5), None);

        let full = Bitfield::all_set(5);
        assert_eq!(full.first_clear(0), None);
    }

    #[test]
    fn test_first_clear_matching_set() {
        let mut requests = Bitfield::new(8);
        requests.set(2);
        let mut peer = Bitfield::new(8);
        peer.set(2);
        peer.set(5);
        // piece 2 is already requested, so 5 is the first candidate
        assert_eq!(requests.first_clear_matching_set(&peer, 0), Some(5));
        assert_eq!(requests.first_clear_matching_set(&peer, 6), None);
    }

    #[test]
    fn test_first_clear_matching_set_in_window() {
        let requests = Bitfield::new(10);
        let peer = Bitfield::all_set(10);
        assert_eq!(
            requests.first_clear_matching_set_in(&peer, 4..7),
            Some(4)
        );
        assert_eq!(requests.first_clear_matching_set_in(&peer, 10..20), None);
    }

    #[test]
    fn test_resize_preserves_low_bits() {
        let mut bf = Bitfield::new(2);
        bf.set(0);
        bf.set(1);
        bf.resize(6);
        assert_eq!(bf.len(), 6);
        assert_eq!(bf.count_set(), 2);
        assert!(bf.get(0) && bf.get(1));
        assert!(!bf.get(2));

        bf.resize(1);
        assert_eq!(bf.count_set(), 1);
    }

    #[test]
    fn test_iter_set() {
        let mut bf = Bitfield::new(9);
        bf.set(1);
        bf.set(8);
        let indices: Vec<usize> = bf.iter_set().collect();
        assert_eq!(indices, vec![1, 8]);
    }
}
