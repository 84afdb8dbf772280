//! Chunk geometry of an encrypted media blob.
//!
//! Every mapping between plaintext offsets, ciphertext offsets and chunk indices goes through
//! [`ChunkedMediaParameters`] so that the network fetcher and the cache always agree on chunk
//! boundaries.
//!
//! Layout:
//! - the blob is split into `total_chunk_count` ciphertext chunks of `chunk_size` bytes, the
//!   last one possibly shorter;
//! - each chunk decrypts independently; a regular chunk yields exactly
//!   `chunk_size - chunk_overhead` plaintext bytes;
//! - the plaintext size of the final chunk is only an estimate
//!   (`tail_ciphertext - tail_overhead`) until the chunk has actually been decrypted. For
//!   ciphers with variable-length padding the tail overhead is the minimum padding, so the
//!   estimate never undershoots the true size.

use crate::crypto::ChunkDecryptor;
use crate::error::{ChunkStreamError, ChunkStreamResult};
use crate::model::ChunkIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedMediaParameters {
    chunk_size: u64,
    blob_size: u64,
    chunk_overhead: u64,
    tail_overhead: u64,
    total_chunk_count: ChunkIndex,
    regular_chunk_count: ChunkIndex,
    regular_chunk_pt_size: u64,
    estimated_pt_size: u64,
}

impl ChunkedMediaParameters {
    /// Derive the chunk geometry for a blob of `blob_size` encrypted bytes split into chunks
    /// of `chunk_size`, where every chunk carries `chunk_overhead` bytes of cipher overhead.
    pub fn new(blob_size: u64, chunk_size: u64, chunk_overhead: u64) -> ChunkStreamResult<Self> {
        Self::with_tail_overhead(blob_size, chunk_size, chunk_overhead, chunk_overhead)
    }

    /// Geometry matching what `decryptor` does to each chunk.
    pub fn for_decryptor(
        blob_size: u64,
        chunk_size: u64,
        decryptor: &dyn ChunkDecryptor,
    ) -> ChunkStreamResult<Self> {
        Self::with_tail_overhead(
            blob_size,
            chunk_size,
            decryptor.chunk_overhead(),
            decryptor.tail_overhead(),
        )
    }

    /// Like [`new`](Self::new), but the estimate of the final chunk's plaintext subtracts
    /// `tail_overhead` instead of `chunk_overhead`.
    pub fn with_tail_overhead(
        blob_size: u64,
        chunk_size: u64,
        chunk_overhead: u64,
        tail_overhead: u64,
    ) -> ChunkStreamResult<Self> {
        if chunk_size == 0 {
            return Err(ChunkStreamError::InvalidParameters("chunk size must be positive"));
        }
        if blob_size == 0 {
            return Err(ChunkStreamError::InvalidParameters("blob size must be positive"));
        }
        if chunk_size <= chunk_overhead {
            return Err(ChunkStreamError::InvalidParameters(
                "chunk size must exceed the per-chunk cipher overhead",
            ));
        }

        let total = blob_size.div_ceil(chunk_size);
        let total_chunk_count = ChunkIndex::try_from(total)
            .map_err(|_| ChunkStreamError::InvalidParameters("too many chunks"))?;
        let regular_chunk_count = total_chunk_count - 1;

        let tail_ct_size = blob_size - u64::from(regular_chunk_count) * chunk_size;
        if tail_ct_size <= tail_overhead {
            return Err(ChunkStreamError::InvalidParameters(
                "final chunk is not larger than the cipher overhead",
            ));
        }

        let regular_chunk_pt_size = chunk_size - chunk_overhead;
        let estimated_pt_size = u64::from(regular_chunk_count) * regular_chunk_pt_size
            + (tail_ct_size - tail_overhead);

        Ok(Self {
            chunk_size,
            blob_size,
            chunk_overhead,
            tail_overhead,
            total_chunk_count,
            regular_chunk_count,
            regular_chunk_pt_size,
            estimated_pt_size,
        })
    }

    /// Encrypted size of a regular chunk.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Total encrypted size of the blob.
    pub fn blob_size(&self) -> u64 {
        self.blob_size
    }

    pub fn chunk_overhead(&self) -> u64 {
        self.chunk_overhead
    }

    pub fn tail_overhead(&self) -> u64 {
        self.tail_overhead
    }

    pub fn total_chunk_count(&self) -> ChunkIndex {
        self.total_chunk_count
    }

    /// Number of chunks with a known, uniform plaintext size.
    pub fn regular_chunk_count(&self) -> ChunkIndex {
        self.regular_chunk_count
    }

    pub fn regular_chunk_pt_size(&self) -> u64 {
        self.regular_chunk_pt_size
    }

    /// Plaintext length reported to the host before the final chunk is decrypted.
    pub fn estimated_pt_size(&self) -> u64 {
        self.estimated_pt_size
    }

    pub fn final_chunk_index(&self) -> ChunkIndex {
        self.regular_chunk_count
    }

    pub fn is_final_chunk(&self, index: ChunkIndex) -> bool {
        index == self.regular_chunk_count
    }

    /// Chunk containing the plaintext byte at `pt_offset`.
    pub fn chunk_index_for_offset(&self, pt_offset: u64) -> ChunkStreamResult<ChunkIndex> {
        if pt_offset >= self.estimated_pt_size {
            return Err(ChunkStreamError::OutOfRange {
                what: "plaintext offset",
                value: pt_offset,
                limit: self.estimated_pt_size,
            });
        }
        // `<= regular_chunk_count`, which fits `ChunkIndex` by construction.
        Ok(self.clamped_chunk_index(pt_offset) as ChunkIndex)
    }

    /// Position of `pt_offset` relative to the start of its chunk's plaintext.
    ///
    /// Offsets past the estimated end are measured from the final chunk.
    pub fn pt_offset_within_chunk(&self, pt_offset: u64) -> u64 {
        pt_offset - self.clamped_chunk_index(pt_offset) * self.regular_chunk_pt_size
    }

    /// Chunk holding `pt_offset`, with everything past the regular chunks mapped to the tail.
    fn clamped_chunk_index(&self, pt_offset: u64) -> u64 {
        (pt_offset / self.regular_chunk_pt_size).min(u64::from(self.regular_chunk_count))
    }

    /// Encrypted size of chunk `index` (0 for indices past the end).
    pub fn chunk_size_at(&self, index: ChunkIndex) -> u64 {
        if index < self.regular_chunk_count {
            self.chunk_size
        } else if index == self.regular_chunk_count {
            self.blob_size - u64::from(self.regular_chunk_count) * self.chunk_size
        } else {
            0
        }
    }

    /// Expected plaintext size of chunk `index`; an estimate for the final chunk.
    pub fn chunk_pt_size(&self, index: ChunkIndex) -> u64 {
        if index < self.regular_chunk_count {
            self.regular_chunk_pt_size
        } else if index == self.regular_chunk_count {
            self.chunk_size_at(index) - self.tail_overhead
        } else {
            0
        }
    }

    /// Byte offset of chunk `index` within the encrypted blob.
    pub fn chunk_ct_offset(&self, index: ChunkIndex) -> u64 {
        u64::from(index.min(self.total_chunk_count)) * self.chunk_size
    }

    /// Byte offset of chunk `index` within the decrypted media (and the cache file).
    pub fn chunk_pt_offset(&self, index: ChunkIndex) -> u64 {
        u64::from(index.min(self.total_chunk_count)) * self.regular_chunk_pt_size
    }

    pub(crate) fn check_index(&self, index: ChunkIndex) -> ChunkStreamResult<()> {
        if index >= self.total_chunk_count {
            return Err(ChunkStreamError::OutOfRange {
                what: "chunk index",
                value: u64::from(index),
                limit: u64::from(self.total_chunk_count),
            });
        }
        Ok(())
    }
}
