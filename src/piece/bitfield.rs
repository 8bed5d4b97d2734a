//! Packed piece bitfield
//!
//! MSB-first bit packing as used on the wire: piece 0 is the high bit
//! of byte 0.

use anyhow::Result;

use crate::error::EngineError;

/// Fixed-length set of piece bits, packed MSB-first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Create an empty bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Reconstruct a bitfield from wire or resume bytes
    ///
    /// The byte slice must be exactly the packed length for `len`
    /// pieces; spare bits in the final byte must be zero.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(EngineError::protocol_with_detail(
                "Bitfield length mismatch",
                format!("expected {} bytes for {} pieces, got {}", expected, len, bytes.len()),
            )
            .into());
        }
        if len % 8 != 0 {
            let spare = bytes[expected - 1] & (0xFFu8 >> (len % 8));
            if spare != 0 {
                return Err(EngineError::protocol("Bitfield has spare bits set").into());
            }
        }
        Ok(Self {
            bits: bytes.to_vec(),
            len,
        })
    }

    /// Number of pieces tracked
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when tracking zero pieces
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Test a single bit
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let byte = self.bits[index / 8];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    /// Set a single bit
    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 1 << (7 - (index % 8));
        }
    }

    /// Clear a single bit
    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] &= !(1 << (7 - (index % 8)));
        }
    }

    /// Number of set bits
    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True when every bit is set
    pub fn is_full(&self) -> bool {
        self.len > 0 && self.count_set() == self.len
    }

    /// Iterate indices of set bits
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// Iterate indices of unset bits
    pub fn iter_missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| !self.get(i))
    }

    /// Packed byte representation
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_clear() {
        let mut bf = Bitfield::new(10);
        assert!(!bf.get(3));
        bf.set(3);
        assert!(bf.get(3));
        bf.clear(3);
        assert!(!bf.get(3));
    }

    #[test]
    fn test_msb_first_packing() {
        let mut bf = Bitfield::new(9);
        bf.set(0);
        bf.set(8);
        assert_eq!(bf.as_bytes(), &[0b1000_0000, 0b1000_0000]);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut bf = Bitfield::new(4);
        bf.set(7);
        assert!(!bf.get(7));
        assert_eq!(bf.count_set(), 0);
    }

    #[test]
    fn test_count_and_full() {
        let mut bf = Bitfield::new(3);
        assert!(!bf.is_full());
        bf.set(0);
        bf.set(1);
        assert_eq!(bf.count_set(), 2);
        bf.set(2);
        assert!(bf.is_full());
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let mut bf = Bitfield::new(12);
        bf.set(0);
        bf.set(11);
        let restored = Bitfield::from_bytes(bf.as_bytes(), 12).unwrap();
        assert_eq!(restored, bf);
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        assert!(Bitfield::from_bytes(&[0u8; 3], 12).is_err());
    }

    #[test]
    fn test_from_bytes_spare_bits_rejected() {
        // 12 pieces leaves the low 4 bits of byte 1 spare
        assert!(Bitfield::from_bytes(&[0x00, 0x0F], 12).is_err());
    }

    #[test]
    fn test_iterators() {
        let mut bf = Bitfield::new(5);
        bf.set(1);
        bf.set(4);
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(bf.iter_missing().collect::<Vec<_>>(), vec![0, 2, 3]);
    }
}
