//! Per-chunk decryption primitives.
//!
//! The engine treats decryption as a black box: a [`ChunkDecryptor`] turns one encrypted
//! chunk into its plaintext, given the chunk index. The decryptor also reports the two
//! constants the engine needs for size bookkeeping:
//! - `chunk_overhead`: how many bytes a full chunk grows by when encrypted;
//! - `block_size`: the tolerance on the final chunk's plaintext length, whose true size is
//!   only known after decryption.
//!
//! Decryptors run on the fetcher task only, one chunk at a time and in stream order, so
//! they may keep state across calls (e.g. a running integrity hash).

use bytes::Bytes;

use crate::error::DecryptError;
use crate::model::ChunkIndex;

pub trait ChunkDecryptor: Send + 'static {
    /// Cipher block size in bytes.
    fn block_size(&self) -> u64;

    /// Ciphertext bytes added to every full chunk.
    fn chunk_overhead(&self) -> u64;

    /// Smallest number of ciphertext bytes the final chunk can carry beyond its plaintext.
    fn tail_overhead(&self) -> u64 {
        self.chunk_overhead()
    }

    /// Decrypt chunk `chunk_index`.
    fn decrypt(
        &mut self,
        ciphertext: Bytes,
        chunk_index: ChunkIndex,
    ) -> Result<Bytes, DecryptError>;
}

/// Identity "decryptor" for blobs stored in the clear.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDecryptor;

impl ChunkDecryptor for PassthroughDecryptor {
    fn block_size(&self) -> u64 {
        1
    }

    fn chunk_overhead(&self) -> u64 {
        0
    }

    fn decrypt(
        &mut self,
        ciphertext: Bytes,
        _chunk_index: ChunkIndex,
    ) -> Result<Bytes, DecryptError> {
        Ok(ciphertext)
    }
}

#[cfg(feature = "aes-decrypt")]
pub use aes_cbc::Aes128CbcChunkCipher;

#[cfg(feature = "aes-decrypt")]
mod aes_cbc {
    use aes::Aes128;
    use bytes::Bytes;
    use cbc::{
        Decryptor, Encryptor,
        cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7},
    };

    use super::ChunkDecryptor;
    use crate::error::{ChunkStreamError, ChunkStreamResult, DecryptError};
    use crate::model::ChunkIndex;

    const BLOCK: usize = 16;

    /// AES-128-CBC with PKCS#7 padding, applied independently to every chunk.
    ///
    /// Each chunk uses its own IV: the base IV read as a big-endian 128-bit integer plus the
    /// chunk index, the same way HLS derives segment IVs from the media sequence number.
    ///
    /// Full chunks carry `block_size()` plaintext bytes less than their ciphertext (one whole
    /// padding block), so the producer must use a chunk size that is a multiple of 16. The
    /// final chunk's padding is 1..=16 bytes, hence its plaintext size is only known once
    /// decrypted; the up-front estimate assumes a single padding byte.
    #[derive(Clone)]
    pub struct Aes128CbcChunkCipher {
        key: [u8; 16],
        iv: [u8; 16],
    }

    impl std::fmt::Debug for Aes128CbcChunkCipher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Aes128CbcChunkCipher").finish_non_exhaustive()
        }
    }

    impl Aes128CbcChunkCipher {
        pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
            Self { key, iv }
        }

        fn chunk_iv(&self, chunk_index: ChunkIndex) -> [u8; 16] {
            u128::from_be_bytes(self.iv)
                .wrapping_add(u128::from(chunk_index))
                .to_be_bytes()
        }

        /// Encrypt one chunk's plaintext. Counterpart of [`ChunkDecryptor::decrypt`], used by
        /// producers and test fixtures.
        pub fn encrypt_chunk(&self, plaintext: &[u8], chunk_index: ChunkIndex) -> Vec<u8> {
            let iv = self.chunk_iv(chunk_index);
            Encryptor::<Aes128>::new((&self.key).into(), (&iv).into())
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        }

        /// Encrypt a whole plaintext into the chunked blob layout for `chunk_size`.
        ///
        /// `chunk_size` must be a multiple of 16 larger than 16.
        pub fn encrypt_blob(
            &self,
            plaintext: &[u8],
            chunk_size: usize,
        ) -> ChunkStreamResult<Vec<u8>> {
            if chunk_size <= BLOCK || chunk_size % BLOCK != 0 {
                return Err(ChunkStreamError::InvalidParameters(
                    "AES chunk size must be a multiple of 16 larger than 16",
                ));
            }
            Ok(plaintext
                .chunks(chunk_size - BLOCK)
                .enumerate()
                .flat_map(|(index, piece)| self.encrypt_chunk(piece, index as ChunkIndex))
                .collect())
        }
    }

    impl ChunkDecryptor for Aes128CbcChunkCipher {
        fn block_size(&self) -> u64 {
            BLOCK as u64
        }

        fn chunk_overhead(&self) -> u64 {
            BLOCK as u64
        }

        fn tail_overhead(&self) -> u64 {
            1
        }

        fn decrypt(
            &mut self,
            ciphertext: Bytes,
            chunk_index: ChunkIndex,
        ) -> Result<Bytes, DecryptError> {
            if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
                return Err(DecryptError::new(format!(
                    "ciphertext length {} is not a positive multiple of {BLOCK}",
                    ciphertext.len()
                )));
            }

            let mut data = ciphertext.to_vec();
            let iv = self.chunk_iv(chunk_index);
            let decryptor = Decryptor::<Aes128>::new((&self.key).into(), (&iv).into());
            decryptor
                .decrypt_padded_mut::<Pkcs7>(&mut data)
                .map(Bytes::copy_from_slice)
                .map_err(|e| DecryptError::new(format!("AES-128-CBC decryption failed: {e}")))
        }
    }

}
