//! Session assembly and the playback host API.
//!
//! [`ChunkedMediaSession::open`] wires the engine together for one media item:
//!
//! ```text
//! host ──DataRequest──▶ broker task ──request_chunk──▶ fetcher task ──▶ RangeTransport
//!   ▲                        │  ▲                           │
//!   └────── DataEvent ───────┘  └──────── FetchEvent ───────┤
//!                            │                              ▼
//!                            └── read ──▶ ChunkStore ◀── write queue task
//! ```
//!
//! The session handle only talks to the broker task. Dropping it (or calling
//! [`ChunkedMediaSession::close`]) tears everything down.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::broker::{BrokerCommand, StreamingRequestBroker};
use crate::crypto::ChunkDecryptor;
use crate::error::{ChunkStreamError, ChunkStreamResult};
use crate::fetcher::{FetchTelemetry, FetchTelemetrySnapshot, RemoteChunkFetcher};
use crate::metadata::MetadataStore;
use crate::model::{ContentInfo, DataEvent, HostRequest, MediaId, RequestId};
use crate::params::ChunkedMediaParameters;
use crate::settings::ChunkStreamSettings;
use crate::store::{CacheStatus, ChunkStore, ChunkWriteQueue};
use crate::transport::RangeTransport;

/// What the caller already knows about the remote blob.
#[derive(Debug, Clone)]
pub struct ChunkedMediaSource {
    pub media_id: MediaId,
    /// Total encrypted size.
    pub blob_size: u64,
    /// Encrypted size of every chunk but the last.
    pub chunk_size: u64,
    /// Sparse file holding the decrypted chunks.
    pub cache_path: PathBuf,
}

/// Streaming session for one encrypted media item.
#[derive(Debug)]
pub struct ChunkedMediaSession {
    params: ChunkedMediaParameters,
    content_info: ContentInfo,
    store: ChunkStore,
    commands: mpsc::UnboundedSender<BrokerCommand>,
    next_request_id: AtomicU64,
    telemetry: Arc<FetchTelemetry>,
}

impl ChunkedMediaSession {
    /// Open the cache, restore progress and start the broker, fetcher and write-queue tasks on
    /// the current tokio runtime.
    pub async fn open(
        source: ChunkedMediaSource,
        settings: &ChunkStreamSettings,
        metadata: Arc<dyn MetadataStore>,
        transport: Arc<dyn RangeTransport>,
        decryptor: Box<dyn ChunkDecryptor>,
    ) -> ChunkStreamResult<Self> {
        let ChunkedMediaSource {
            media_id,
            blob_size,
            chunk_size,
            cache_path,
        } = source;
        let params =
            ChunkedMediaParameters::for_decryptor(blob_size, chunk_size, decryptor.as_ref())?;

        let store = tokio::task::spawn_blocking(move || {
            ChunkStore::open(cache_path, params, media_id, metadata)
        })
        .await
        .map_err(|e| ChunkStreamError::io(format!("cache open task failed: {e}")))??;

        let (event_tx, event_rx) = mpsc::channel(settings.event_channel_capacity.max(1));
        let fetcher = RemoteChunkFetcher::new(
            store.clone(),
            ChunkWriteQueue::spawn(store.clone()),
            transport,
            decryptor,
            settings.max_lookahead,
            event_tx,
        )
        .spawn();
        let telemetry = fetcher.shared_telemetry();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let broker = StreamingRequestBroker::new(store.clone(), fetcher);
        tokio::spawn(broker.run(command_rx, event_rx));

        let content_info = ContentInfo {
            content_type: settings.resolved_content_type(),
            content_length: params.estimated_pt_size(),
            supports_range_access: true,
        };
        debug!(
            media_id = %store.media_id(),
            chunks = params.total_chunk_count(),
            content_length = content_info.content_length,
            cached = store.cached_chunk_count(),
            "session: opened"
        );

        Ok(Self {
            params,
            content_info,
            store,
            commands,
            next_request_id: AtomicU64::new(1),
            telemetry,
        })
    }

    /// Convenience constructor streaming from `url` over HTTP.
    #[cfg(feature = "http")]
    pub async fn open_http(
        url: url::Url,
        source: ChunkedMediaSource,
        settings: &ChunkStreamSettings,
        metadata: Arc<dyn MetadataStore>,
        decryptor: Box<dyn ChunkDecryptor>,
    ) -> ChunkStreamResult<Self> {
        let transport = crate::transport::HttpRangeTransport::new(url, settings)?;
        Self::open(source, settings, metadata, Arc::new(transport), decryptor).await
    }

    /// Content metadata for the host. Needs neither the network nor the cache.
    pub fn content_info(&self) -> ContentInfo {
        self.content_info.clone()
    }

    pub fn params(&self) -> &ChunkedMediaParameters {
        &self.params
    }

    pub fn media_id(&self) -> &MediaId {
        self.store.media_id()
    }

    /// Ask for plaintext bytes `[offset, offset + length)`.
    pub fn request_data(&self, offset: u64, length: u64) -> DataRequest {
        self.submit(HostRequest::Data { offset, length })
    }

    /// Ask for everything from `offset` to the end of the media.
    pub fn request_to_end(&self, offset: u64) -> DataRequest {
        let length = self.params.estimated_pt_size().saturating_sub(offset);
        self.request_data(offset, length.max(1))
    }

    /// Submit a raw host request on the data path.
    pub fn submit(&self, request: HostRequest) -> DataRequest {
        let id = RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (tx, events) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let command = BrokerCommand::Submit {
            id,
            request,
            events: tx,
            cancelled: cancelled.clone(),
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let BrokerCommand::Submit { events, .. } = command {
                let _ = events.send(DataEvent::Failed(ChunkStreamError::Closed));
            }
        }

        DataRequest {
            id,
            events,
            cancelled,
            commands: self.commands.clone(),
            done: false,
        }
    }

    pub fn status(&self) -> CacheStatus {
        self.store.status()
    }

    pub fn telemetry(&self) -> FetchTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Stop the transfer, close the cache file and fail pending requests with
    /// [`ChunkStreamError::Cancelled`]. Idempotent.
    pub fn close(&self) {
        if self.commands.send(BrokerCommand::Close).is_err() {
            trace!("session: already closed");
        }
    }
}

impl Drop for ChunkedMediaSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Host-side handle of one data request.
///
/// Dropping it before the request completes cancels it.
#[derive(Debug)]
pub struct DataRequest {
    id: RequestId,
    events: mpsc::UnboundedReceiver<DataEvent>,
    cancelled: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<BrokerCommand>,
    done: bool,
}

impl DataRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Next progress event; `None` once a terminal event has been returned.
    ///
    /// If the session goes away without answering, a final `Failed(Closed)` is reported.
    pub async fn next_event(&mut self) -> Option<DataEvent> {
        if self.done {
            return None;
        }
        let event = self
            .events
            .recv()
            .await
            .unwrap_or(DataEvent::Failed(ChunkStreamError::Closed));
        if matches!(event, DataEvent::Finished | DataEvent::Failed(_)) {
            self.done = true;
        }
        Some(event)
    }

    /// Collect the whole range.
    pub async fn read_to_end(mut self) -> ChunkStreamResult<Bytes> {
        let mut out = BytesMut::new();
        while let Some(event) = self.next_event().await {
            match event {
                DataEvent::Data(bytes) => out.extend_from_slice(&bytes),
                DataEvent::Finished => return Ok(out.freeze()),
                DataEvent::Failed(e) => return Err(e),
            }
        }
        Err(ChunkStreamError::Closed)
    }

    /// Withdraw the request. Chunks already being streamed keep warming the cache.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.cancelled.store(true, Ordering::Release);
        let _ = self.commands.send(BrokerCommand::Cancel(self.id));
    }
}

impl Drop for DataRequest {
    fn drop(&mut self) {
        self.cancel();
    }
}
