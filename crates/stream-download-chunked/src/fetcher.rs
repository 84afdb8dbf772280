//! Network side of the engine: one range connection, chunk accumulation and decryption.
//!
//! [`RemoteChunkFetcher`] runs as its own tokio task and owns all connection state. The
//! broker drives it through a [`FetcherHandle`] and hears back through [`FetchEvent`]s; the
//! only thing the two share is the [`ChunkStore`].
//!
//! Connection lifecycle:
//! - Idle: no connection. Any `request_chunk` for an uncached chunk opens one at that chunk.
//! - Streaming: bytes arrive in order from `current_index`. A request behind the stream, or
//!   more than `max_lookahead` chunks ahead of it, tears the connection down and reopens it at
//!   the requested chunk.
//! - Failed: the last connection died with a session error. Reported once through
//!   [`FetchEvent::ChunkError`]; nothing is retried until the next `request_chunk`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::crypto::ChunkDecryptor;
use crate::error::{ChunkStreamError, ChunkStreamResult};
use crate::model::ChunkIndex;
use crate::params::ChunkedMediaParameters;
use crate::store::{ChunkStore, ChunkWriteQueue, WriteOutcome};
use crate::transport::{ByteStream, RangeTransport};

/// Notification from the fetcher to the broker.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// Chunk `index` is now readable from the store.
    ChunkAvailable(ChunkIndex),
    /// A fetch failed. `index` names the chunk for chunk-local failures; session errors carry
    /// `None` and also mean the connection is gone.
    ChunkError {
        index: Option<ChunkIndex>,
        error: ChunkStreamError,
    },
}

/// Anything the broker can ask for chunks.
pub trait ChunkSource: Send + 'static {
    fn request_chunk(&mut self, index: ChunkIndex);

    /// Cancel the open connection, if any. Idempotent.
    fn stop_transfer(&mut self);
}

#[derive(Debug)]
enum FetchCommand {
    RequestChunk(ChunkIndex),
    Stop,
}

/// Transfer counters, updated by the fetcher task.
#[derive(Debug, Default)]
pub struct FetchTelemetry {
    bytes_received: AtomicU64,
    connections_opened: AtomicU64,
    reseeks: AtomicU64,
    chunks_decrypted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchTelemetrySnapshot {
    pub bytes_received: u64,
    pub connections_opened: u64,
    /// Connections opened while another one was still streaming.
    pub reseeks: u64,
    pub chunks_decrypted: u64,
}

impl FetchTelemetry {
    pub fn snapshot(&self) -> FetchTelemetrySnapshot {
        FetchTelemetrySnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            reseeks: self.reseeks.load(Ordering::Relaxed),
            chunks_decrypted: self.chunks_decrypted.load(Ordering::Relaxed),
        }
    }
}

/// Owner-side handle of a running fetcher task. Dropping it shuts the task down.
#[derive(Debug)]
pub struct FetcherHandle {
    commands: mpsc::UnboundedSender<FetchCommand>,
    cancel: CancellationToken,
    telemetry: Arc<FetchTelemetry>,
}

impl FetcherHandle {
    pub fn telemetry(&self) -> FetchTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Counters that outlive the handle.
    pub fn shared_telemetry(&self) -> Arc<FetchTelemetry> {
        self.telemetry.clone()
    }

    /// Stop the task for good; pending commands are discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn send(&self, command: FetchCommand) {
        if self.commands.send(command).is_err() {
            trace!("fetcher: task already finished, command dropped");
        }
    }
}

impl ChunkSource for FetcherHandle {
    fn request_chunk(&mut self, index: ChunkIndex) {
        self.send(FetchCommand::RequestChunk(index));
    }

    fn stop_transfer(&mut self) {
        self.send(FetchCommand::Stop);
    }
}

impl Drop for FetcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct RemoteChunkFetcher {
    params: ChunkedMediaParameters,
    store: ChunkStore,
    writes: ChunkWriteQueue,
    transport: Arc<dyn RangeTransport>,
    decryptor: Box<dyn ChunkDecryptor>,
    max_lookahead: u32,
    events: mpsc::Sender<FetchEvent>,
    telemetry: Arc<FetchTelemetry>,

    write_tx: mpsc::UnboundedSender<WriteOutcome>,
    write_rx: mpsc::UnboundedReceiver<WriteOutcome>,

    connection: Option<ByteStream>,
    /// Index of the chunk the accumulation buffer is filling.
    current_index: ChunkIndex,
    requested_index: Option<ChunkIndex>,
    buffer: BytesMut,
    /// Chunks handed to the write queue whose outcome has not come back yet.
    pending_writes: BTreeSet<ChunkIndex>,
    failed: bool,
}

impl RemoteChunkFetcher {
    pub fn new(
        store: ChunkStore,
        writes: ChunkWriteQueue,
        transport: Arc<dyn RangeTransport>,
        decryptor: Box<dyn ChunkDecryptor>,
        max_lookahead: u32,
        events: mpsc::Sender<FetchEvent>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Self {
            params: *store.params(),
            store,
            writes,
            transport,
            decryptor,
            max_lookahead: max_lookahead.max(1),
            events,
            telemetry: Arc::new(FetchTelemetry::default()),
            write_tx,
            write_rx,
            connection: None,
            current_index: 0,
            requested_index: None,
            buffer: BytesMut::new(),
            pending_writes: BTreeSet::new(),
            failed: false,
        }
    }

    /// Spawn the fetcher on the current tokio runtime.
    pub fn spawn(self) -> FetcherHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = FetcherHandle {
            commands,
            cancel: cancel.clone(),
            telemetry: self.telemetry.clone(),
        };
        tokio::spawn(self.run(rx, cancel));
        handle
    }

    #[instrument(skip_all, fields(media_id = %self.store.media_id()))]
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<FetchCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(FetchCommand::RequestChunk(index)) => {
                        self.request_chunk(index, &cancel).await;
                    }
                    Some(FetchCommand::Stop) => self.stop_transfer(),
                    None => break,
                },

                Some(outcome) = self.write_rx.recv() => {
                    self.on_write_outcome(outcome, &cancel).await;
                }

                fragment = next_fragment(&mut self.connection) => {
                    self.on_fragment(fragment).await;
                }
            }
        }
        self.connection = None;
        debug!(telemetry = ?self.telemetry.snapshot(), "fetcher: finished");
    }

    async fn request_chunk(&mut self, index: ChunkIndex, cancel: &CancellationToken) {
        if let Err(error) = self.params.check_index(index) {
            self.emit(FetchEvent::ChunkError {
                index: Some(index),
                error,
            })
            .await;
            return;
        }
        self.requested_index = Some(index);

        if self.store.is_cached(index) {
            trace!(index, "fetcher: chunk already cached");
            self.emit(FetchEvent::ChunkAvailable(index)).await;
            return;
        }
        if self.pending_writes.contains(&index) {
            trace!(index, "fetcher: chunk is being written");
            return;
        }

        let reseek = match self.connection {
            None => true,
            Some(_) => {
                self.current_index > index || index - self.current_index > self.max_lookahead
            }
        };
        if reseek {
            self.open_connection(index, cancel).await;
        } else {
            trace!(
                index,
                current = self.current_index,
                "fetcher: chunk will arrive on the open connection"
            );
        }
    }

    async fn open_connection(&mut self, index: ChunkIndex, cancel: &CancellationToken) {
        let replacing = self.connection.take().is_some();
        self.buffer.clear();
        self.current_index = index;
        self.failed = false;

        let start = self.params.chunk_ct_offset(index);
        debug!(index, start, replacing, "fetcher: opening connection");

        let transport = self.transport.clone();
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            res = transport.open_stream(start) => res,
        };
        match opened {
            Ok(stream) => {
                self.telemetry
                    .connections_opened
                    .fetch_add(1, Ordering::Relaxed);
                if replacing {
                    self.telemetry.reseeks.fetch_add(1, Ordering::Relaxed);
                }
                self.connection = Some(stream);
            }
            Err(e) => self.fail_session(e).await,
        }
    }

    fn stop_transfer(&mut self) {
        if self.connection.take().is_some() {
            debug!(current = self.current_index, "fetcher: transfer stopped");
        }
        self.buffer.clear();
    }

    async fn on_fragment(&mut self, fragment: Option<ChunkStreamResult<Bytes>>) {
        let data = match fragment {
            Some(Ok(data)) => data,
            Some(Err(e)) => return self.fail_session(e).await,
            None => {
                let err = ChunkStreamError::transport(format!(
                    "stream ended early at chunk {} ({} buffered bytes)",
                    self.current_index,
                    self.buffer.len()
                ));
                return self.fail_session(err).await;
            }
        };

        self.telemetry
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.buffer.extend_from_slice(&data);

        let total = self.params.total_chunk_count();
        while self.current_index < total {
            let index = self.current_index;
            let needed = self.params.chunk_size_at(index) as usize;
            if self.buffer.len() < needed {
                break;
            }
            let ciphertext = self.buffer.split_to(needed).freeze();
            self.current_index += 1;

            match self.decrypt_chunk(index, ciphertext) {
                Ok(plaintext) => {
                    self.pending_writes.insert(index);
                    self.writes
                        .write_chunk_if_uncached(index, plaintext, self.write_tx.clone());
                }
                Err(e) => return self.fail_session(e).await,
            }
        }

        if self.current_index >= total {
            debug!("fetcher: reached end of blob");
            self.connection = None;
            self.buffer.clear();
        }
    }

    fn decrypt_chunk(&mut self, index: ChunkIndex, ciphertext: Bytes) -> ChunkStreamResult<Bytes> {
        let plaintext = self
            .decryptor
            .decrypt(ciphertext, index)
            .map_err(|source| ChunkStreamError::Decrypt {
                chunk_index: index,
                source,
            })?;
        self.telemetry
            .chunks_decrypted
            .fetch_add(1, Ordering::Relaxed);

        let actual = plaintext.len() as u64;
        let expected = self.params.chunk_pt_size(index);
        let acceptable = if self.params.is_final_chunk(index) {
            actual.abs_diff(expected) < self.decryptor.block_size()
        } else {
            actual == expected
        };
        if !acceptable {
            return Err(ChunkStreamError::PlaintextSizeMismatch {
                chunk_index: index,
                expected,
                actual,
            });
        }
        trace!(index, bytes = actual, "fetcher: chunk decrypted");
        Ok(plaintext)
    }

    async fn on_write_outcome(&mut self, outcome: WriteOutcome, cancel: &CancellationToken) {
        let WriteOutcome {
            index,
            next_uncached,
            result,
        } = outcome;
        self.pending_writes.remove(&index);

        if let Err(error) = result {
            warn!(index, "fetcher: failed to cache chunk: {error}");
            self.emit(FetchEvent::ChunkError {
                index: Some(index),
                error,
            })
            .await;
            return;
        }
        self.emit(FetchEvent::ChunkAvailable(index)).await;

        if self.connection.is_none() {
            return;
        }
        let ahead = next_uncached.saturating_sub(self.current_index);
        if ahead < self.max_lookahead {
            return;
        }
        if next_uncached >= self.params.total_chunk_count() {
            debug!(index, "fetcher: remainder already cached, stopping");
            self.stop_transfer();
        } else {
            debug!(
                current = self.current_index,
                next_uncached,
                requested = ?self.requested_index,
                "fetcher: skipping over cached chunks"
            );
            self.open_connection(next_uncached, cancel).await;
        }
    }

    async fn fail_session(&mut self, err: ChunkStreamError) {
        warn!(
            current = self.current_index,
            requested = ?self.requested_index,
            "fetcher: session failed: {err}"
        );
        self.connection = None;
        self.buffer.clear();
        self.failed = true;
        self.emit(FetchEvent::ChunkError {
            index: None,
            error: err,
        })
        .await;
    }

    async fn emit(&mut self, event: FetchEvent) {
        if self.events.send(event).await.is_err() {
            trace!(failed = self.failed, "fetcher: broker gone, event dropped");
        }
    }
}

/// Next fragment of the open connection; never resolves while idle.
async fn next_fragment(connection: &mut Option<ByteStream>) -> Option<ChunkStreamResult<Bytes>> {
    match connection {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
