//! Unified crate-level error types.
//!
//! A single [`ChunkStreamError`] is shared by every layer of the engine (chunk math, cache,
//! network fetcher and request broker) together with a [`ChunkStreamResult`] alias.
//!
//! The error is `Clone` because one session-level failure (a broken connection, a chunk that
//! failed authentication) has to be fanned out to every pending host request that was waiting
//! on it. I/O errors are therefore kept behind an `Arc`.

use std::io;
use std::sync::Arc;

use crate::model::ChunkIndex;

/// Result type used by this crate.
pub type ChunkStreamResult<T> = Result<T, ChunkStreamError>;

/// Failure reported by a [`ChunkDecryptor`](crate::ChunkDecryptor).
///
/// Opaque on purpose: the decryption primitive is a collaborator and its failure modes
/// (bad tag, bad padding, wrong key) all mean the same thing to the engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DecryptError(String);

impl DecryptError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Unified error type for the `stream-download-chunked` crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChunkStreamError {
    /// Blob or chunk geometry cannot describe a chunked media item.
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),

    /// An offset or chunk index fell outside the media item.
    #[error("{what} {value} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        value: u64,
        limit: u64,
    },

    /// Decryption produced a plaintext of unexpected length.
    #[error("plaintext size mismatch for chunk {chunk_index}: expected {expected} got {actual}")]
    PlaintextSizeMismatch {
        chunk_index: ChunkIndex,
        expected: u64,
        actual: u64,
    },

    /// Cache file or metadata I/O failed.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A chunk failed authentication or decryption.
    #[error("failed to decrypt chunk {chunk_index}: {source}")]
    Decrypt {
        chunk_index: ChunkIndex,
        #[source]
        source: DecryptError,
    },

    /// The range connection failed or ended unexpectedly.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote answered a range request with an unusable status.
    #[error("remote request failed with HTTP status {status}")]
    HttpStatus { status: u16 },

    /// The host submitted something other than a data request on the data path.
    #[error("invalid active request: {0}")]
    InvalidActiveRequest(&'static str),

    /// `read_chunk` was called for a chunk whose bitmap bit is unset.
    #[error("chunk {0} is not cached")]
    NotCached(ChunkIndex),

    /// The chunk store (or the whole session) has been closed.
    #[error("chunk store is closed")]
    Closed,

    /// Operation cancelled by the owner of the session.
    #[error("operation cancelled")]
    Cancelled,
}

impl ChunkStreamError {
    /// Convenience helper to wrap a transport failure message.
    pub fn transport(msg: impl Into<String>) -> Self {
        ChunkStreamError::Transport(msg.into())
    }

    /// Convenience helper to build an [`io::Error`]-backed variant from a message.
    pub fn io(msg: impl Into<String>) -> Self {
        ChunkStreamError::Io(Arc::new(io::Error::other(msg.into())))
    }

    /// Returns true if this error terminates the current network connection.
    ///
    /// Session errors are propagated to every pending request waiting on the connection;
    /// everything else only fails the request that triggered it.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            ChunkStreamError::PlaintextSizeMismatch { .. }
                | ChunkStreamError::Decrypt { .. }
                | ChunkStreamError::Transport(_)
                | ChunkStreamError::HttpStatus { .. }
        )
    }
}

impl From<io::Error> for ChunkStreamError {
    fn from(err: io::Error) -> Self {
        ChunkStreamError::Io(Arc::new(err))
    }
}
