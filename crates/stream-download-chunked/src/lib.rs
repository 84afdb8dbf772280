//! Chunked encrypted media streaming with a resumable on-disk cache.
//!
//! A media item is stored remotely as one encrypted blob cut into fixed-size chunks that
//! decrypt independently. This crate lets a playback host read plaintext byte ranges of that
//! item before it has been fully downloaded, while every decrypted chunk is written to a local
//! cache that survives restarts.
//!
//! This crate is composed of several modules:
//! - `params`: chunk geometry, the single source of offset/index arithmetic.
//! - `bitmap` and `store`: the durable chunk cache and its presence bitmap.
//! - `metadata`: persistence of cache progress (`MetadataStore` plus memory/file backends).
//! - `crypto`: per-chunk decryption (`ChunkDecryptor`, AES-128-CBC behind `aes-decrypt`).
//! - `transport`: byte-range streaming (`RangeTransport`, reqwest-based behind `http`).
//! - `fetcher`: the network task: one connection, accumulation, decryption, look-ahead.
//! - `broker`: the host-facing pull protocol over a stack of pending requests.
//! - `session`: wiring of the above and the host handles.
//! - `settings`, `error`, `model`: configuration, the unified error type and shared values.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types from the internal
//! modules to form the public API of the `stream-download-chunked` crate.

mod bitmap;
mod broker;
mod crypto;
mod error;
mod fetcher;
mod metadata;
mod model;
mod params;
mod session;
mod settings;
mod store;
mod transport;

pub use crate::bitmap::ChunkBitmap;
pub use crate::broker::StreamingRequestBroker;
pub use crate::error::{ChunkStreamError, ChunkStreamResult, DecryptError};
pub use crate::fetcher::{
    ChunkSource, FetchEvent, FetchTelemetry, FetchTelemetrySnapshot, FetcherHandle,
    RemoteChunkFetcher,
};
pub use crate::metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore};
pub use crate::model::{
    ChunkIndex, ContentInfo, DataEvent, HostRequest, MediaId, MediaKind, RequestId,
};
pub use crate::params::ChunkedMediaParameters;
pub use crate::session::{ChunkedMediaSession, ChunkedMediaSource, DataRequest};
pub use crate::settings::{ChunkStreamSettings, DEFAULT_MAX_LOOKAHEAD};
pub use crate::store::{CacheStatus, ChunkStore, ChunkWriteQueue, WriteOutcome};
pub use crate::transport::{ByteStream, RangeTransport};

pub use crate::crypto::{ChunkDecryptor, PassthroughDecryptor};

#[cfg(feature = "aes-decrypt")]
pub use crate::crypto::Aes128CbcChunkCipher;

#[cfg(feature = "http")]
pub use crate::transport::HttpRangeTransport;
