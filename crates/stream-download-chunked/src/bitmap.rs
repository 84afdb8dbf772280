//! Fixed-length presence bitmap, one bit per chunk.
//!
//! Persisted form: a 4-byte little-endian bit count followed by the bits packed LSB-first.
//! Trailing bits of the last byte must be zero. Anything else is rejected by
//! [`ChunkBitmap::from_bytes`] so the caller can fail closed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::model::ChunkIndex;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    len: ChunkIndex,
    bits: Vec<u8>,
}

impl ChunkBitmap {
    /// Empty bitmap for `len` chunks.
    pub fn new(len: ChunkIndex) -> Self {
        Self {
            len,
            bits: vec![0; byte_len(len)],
        }
    }

    /// Decode a persisted bitmap, returning `None` unless it describes exactly
    /// `expected_len` chunks.
    pub fn from_bytes(raw: &[u8], expected_len: ChunkIndex) -> Option<Self> {
        let (header, bits) = raw.split_first_chunk::<HEADER_LEN>()?;
        let len = ChunkIndex::from_le_bytes(*header);
        if len != expected_len || bits.len() != byte_len(len) {
            return None;
        }
        let rem = len % 8;
        if rem != 0 {
            let last = *bits.last()?;
            if last >> rem != 0 {
                return None;
            }
        }
        Some(Self {
            len,
            bits: bits.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.bits.len());
        out.put_u32_le(self.len);
        out.put_slice(&self.bits);
        out.freeze()
    }

    pub fn len(&self) -> ChunkIndex {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: ChunkIndex) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[(index / 8) as usize] & (1u8 << (index % 8)) != 0
    }

    /// Set the bit for `index`. Returns true if it was previously unset.
    pub fn set(&mut self, index: ChunkIndex) -> bool {
        if index >= self.len {
            return false;
        }
        let byte = &mut self.bits[(index / 8) as usize];
        let mask = 1u8 << (index % 8);
        let was_unset = *byte & mask == 0;
        *byte |= mask;
        was_unset
    }

    pub fn count_ones(&self) -> ChunkIndex {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count_ones() == self.len
    }

    /// First unset index at or after `from`, or `len()` if every remaining bit is set.
    pub fn next_unset_from(&self, from: ChunkIndex) -> ChunkIndex {
        (from..self.len).find(|&i| !self.get(i)).unwrap_or(self.len)
    }
}

fn byte_len(len: ChunkIndex) -> usize {
    len.div_ceil(8) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_form_round_trips() {
        let mut bitmap = ChunkBitmap::new(11);
        for i in [0, 3, 8, 10] {
            assert!(bitmap.set(i));
        }
        let raw = bitmap.to_bytes();
        assert_eq!(raw.len(), 4 + 2);
        assert_eq!(ChunkBitmap::from_bytes(&raw, 11), Some(bitmap));
    }

    #[test]
    fn mismatched_length_fails_closed() {
        let mut bitmap = ChunkBitmap::new(3);
        bitmap.set(0);
        let raw = bitmap.to_bytes();
        assert_eq!(ChunkBitmap::from_bytes(&raw, 4), None);
        assert_eq!(ChunkBitmap::from_bytes(&raw[..2], 3), None);
        assert_eq!(ChunkBitmap::from_bytes(&[], 3), None);

        // stray bit beyond the last chunk
        let mut corrupt = raw.to_vec();
        corrupt[4] |= 0b1000_0000;
        assert_eq!(ChunkBitmap::from_bytes(&corrupt, 3), None);
    }

    #[test]
    fn set_is_idempotent() {
        let mut bitmap = ChunkBitmap::new(2);
        assert!(bitmap.set(1));
        assert!(!bitmap.set(1));
        assert!(!bitmap.set(5));
        assert_eq!(bitmap.count_ones(), 1);
        assert!(!bitmap.is_complete());
        bitmap.set(0);
        assert!(bitmap.is_complete());
    }

    #[test]
    fn next_unset_scans_forward() {
        let mut bitmap = ChunkBitmap::new(5);
        bitmap.set(0);
        bitmap.set(1);
        bitmap.set(3);
        assert_eq!(bitmap.next_unset_from(0), 2);
        assert_eq!(bitmap.next_unset_from(3), 4);
        bitmap.set(4);
        assert_eq!(bitmap.next_unset_from(3), 5);
        assert_eq!(bitmap.next_unset_from(9), 5);
    }
}
