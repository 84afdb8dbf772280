//! Host-facing side of the engine: the pull protocol.
//!
//! The playback host asks for plaintext byte ranges at arbitrary times and may abandon them
//! at will. [`StreamingRequestBroker`] keeps those asks on a stack and only ever works on the
//! most recent live one; older entries wait underneath until the top is finished, cancelled or
//! failed. Cache hits are answered straight from the [`ChunkStore`]; misses go to the
//! [`ChunkSource`] and resume when the matching [`FetchEvent`] comes back.
//!
//! All broker state is touched from one task only; the cache is the only thing shared with
//! the fetcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::error::ChunkStreamError;
use crate::fetcher::{ChunkSource, FetchEvent};
use crate::model::{ChunkIndex, DataEvent, HostRequest, RequestId};
use crate::params::ChunkedMediaParameters;
use crate::store::ChunkStore;

/// Message from the session to the broker task.
#[derive(Debug)]
pub(crate) enum BrokerCommand {
    Submit {
        id: RequestId,
        request: HostRequest,
        events: mpsc::UnboundedSender<DataEvent>,
        cancelled: Arc<AtomicBool>,
    },
    Cancel(RequestId),
    Close,
}

/// One outstanding data request.
#[derive(Debug)]
struct PendingReadRequest {
    id: RequestId,
    /// Next plaintext byte to deliver.
    offset: u64,
    remaining: u64,
    cancelled: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<DataEvent>,
}

impl PendingReadRequest {
    fn is_stale(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.events.is_closed()
    }

    fn fail(self, err: ChunkStreamError) {
        debug!(request = %self.id, "broker: request failed: {err}");
        let _ = self.events.send(DataEvent::Failed(err));
    }
}

pub struct StreamingRequestBroker<S> {
    params: ChunkedMediaParameters,
    store: ChunkStore,
    source: S,
    /// Most recent request last.
    requests: Vec<PendingReadRequest>,
    /// Request and chunk the source was last asked for.
    awaiting: Option<(RequestId, ChunkIndex)>,
    closed: bool,
}

impl<S: ChunkSource> StreamingRequestBroker<S> {
    pub fn new(store: ChunkStore, source: S) -> Self {
        Self {
            params: *store.params(),
            store,
            source,
            requests: Vec::new(),
            awaiting: None,
            closed: false,
        }
    }

    /// Number of requests that are neither finished, failed nor cancelled.
    pub fn pending_requests(&self) -> usize {
        self.requests.iter().filter(|r| !r.is_stale()).count()
    }

    /// Accept a host request. Progress and the final outcome are reported through `events`.
    pub fn handle_request(
        &mut self,
        id: RequestId,
        request: HostRequest,
        events: mpsc::UnboundedSender<DataEvent>,
        cancelled: Arc<AtomicBool>,
    ) {
        if self.closed {
            let _ = events.send(DataEvent::Failed(ChunkStreamError::Closed));
            return;
        }

        let (offset, length) = match request {
            HostRequest::Data { offset, length } => (offset, length),
            HostRequest::ContentInfo => {
                let _ = events.send(DataEvent::Failed(ChunkStreamError::InvalidActiveRequest(
                    "content info requested on the data path",
                )));
                return;
            }
        };

        if length == 0 {
            let _ = events.send(DataEvent::Finished);
            return;
        }
        let end = self.params.estimated_pt_size();
        if offset >= end {
            let _ = events.send(DataEvent::Failed(ChunkStreamError::OutOfRange {
                what: "request offset",
                value: offset,
                limit: end,
            }));
            return;
        }

        let remaining = length.min(end - offset);
        trace!(request = %id, offset, length, remaining, "broker: data request");
        self.requests.push(PendingReadRequest {
            id,
            offset,
            remaining,
            cancelled,
            events,
        });
        self.process_active();
    }

    /// Drop a request. The fetcher is left alone; whatever it is streaming still warms the
    /// cache.
    pub fn cancel_request(&mut self, id: RequestId) {
        let was_awaited = self.awaiting.is_some_and(|(awaited, _)| awaited == id);
        if was_awaited {
            self.awaiting = None;
        }

        let Some(pos) = self.requests.iter().position(|r| r.id == id) else {
            // already dropped as stale; whoever is now on top may still need its chunk
            if was_awaited {
                self.process_active();
            }
            return;
        };
        let request = self.requests.remove(pos);
        request.cancelled.store(true, Ordering::Release);
        trace!(request = %id, "broker: request cancelled");

        if pos == self.requests.len() {
            self.process_active();
        }
    }

    pub fn chunk_available(&mut self, index: ChunkIndex) {
        if self.closed {
            return;
        }
        if self.awaiting.is_some_and(|(_, awaited)| awaited == index) {
            self.awaiting = None;
        } else {
            trace!(index, awaiting = ?self.awaiting, "broker: chunk was not awaited");
        }
        // also re-requests for a request that surfaced after a stale one was dropped
        self.process_active();
    }

    /// React to a failed fetch. `index` is the chunk a chunk-local error belongs to.
    pub fn chunk_error(&mut self, index: Option<ChunkIndex>, err: ChunkStreamError) {
        if self.closed {
            return;
        }

        if err.is_session_error() {
            self.awaiting = None;
            warn!(pending = self.requests.len(), "broker: fetch session failed: {err}");
            for request in self.requests.drain(..).rev() {
                if !request.is_stale() {
                    request.fail(err.clone());
                }
            }
            return;
        }

        let needed = self.active_chunk();
        if index.is_some() && index != needed {
            debug!(?index, ?needed, "broker: error for a chunk nobody waits on: {err}");
            self.process_active();
            return;
        }
        self.awaiting = None;
        match self.requests.pop() {
            Some(active) => active.fail(err),
            None => warn!("broker: chunk error with no active request: {err}"),
        }
        self.process_active();
    }

    /// Stop the fetcher, close the cache and fail everything still pending. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.awaiting = None;
        self.source.stop_transfer();
        self.store.close();
        for request in self.requests.drain(..).rev() {
            if !request.is_stale() {
                request.fail(ChunkStreamError::Cancelled);
            }
        }
        debug!(media_id = %self.store.media_id(), "broker: closed");
    }

    #[instrument(skip_all, fields(media_id = %self.store.media_id()))]
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BrokerCommand>,
        mut events: mpsc::Receiver<FetchEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(BrokerCommand::Submit { id, request, events: reply, cancelled }) => {
                        self.handle_request(id, request, reply, cancelled);
                    }
                    Some(BrokerCommand::Cancel(id)) => self.cancel_request(id),
                    Some(BrokerCommand::Close) | None => break,
                },

                Some(event) = events.recv() => match event {
                    FetchEvent::ChunkAvailable(index) => self.chunk_available(index),
                    FetchEvent::ChunkError { index, error } => self.chunk_error(index, error),
                },
            }
        }
        self.close();
    }

    fn pop_stale(&mut self) {
        while self.requests.last().is_some_and(PendingReadRequest::is_stale) {
            if let Some(stale) = self.requests.pop() {
                trace!(request = %stale.id, "broker: dropping stale request");
            }
        }
    }

    /// Chunk the top live request needs next.
    fn active_chunk(&mut self) -> Option<ChunkIndex> {
        self.pop_stale();
        let top = self.requests.last()?;
        self.params.chunk_index_for_offset(top.offset).ok()
    }

    /// Serve the top live request from the cache for as long as its chunks are present.
    fn process_active(&mut self) {
        loop {
            self.pop_stale();
            let Some(top) = self.requests.last() else {
                self.awaiting = None;
                return;
            };
            let id = top.id;

            let index = match self.params.chunk_index_for_offset(top.offset) {
                Ok(index) => index,
                Err(e) => {
                    self.fail_active(e);
                    continue;
                }
            };

            if !self.store.is_cached(index) {
                if self.awaiting != Some((id, index)) {
                    self.awaiting = Some((id, index));
                    debug!(request = %id, index, "broker: waiting for chunk");
                    self.source.request_chunk(index);
                }
                return;
            }

            match self.store.read_chunk(index) {
                Ok(chunk) => self.deliver(index, chunk),
                Err(e) => self.fail_active(e),
            }
        }
    }

    /// Hand the part of cached chunk `index` the top request needs to the host.
    fn deliver(&mut self, index: ChunkIndex, chunk: Bytes) {
        let params = self.params;
        let Some(top) = self.requests.last_mut() else {
            return;
        };

        let within = params.pt_offset_within_chunk(top.offset);
        let span = (params.chunk_pt_size(index) - within).min(top.remaining);
        let (start, end) = (within as usize, (within + span) as usize);

        let data = if end <= chunk.len() {
            chunk.slice(start..end)
        } else {
            // the true tail is shorter than the length reported to the host
            let mut padded = BytesMut::zeroed(end - start);
            if start < chunk.len() {
                padded[..chunk.len() - start].copy_from_slice(&chunk[start..]);
            }
            trace!(
                request = %top.id,
                index,
                padding = end - start.max(chunk.len()),
                "broker: zero-padding tail"
            );
            padded.freeze()
        };

        if top.events.send(DataEvent::Data(data)).is_err() {
            top.cancelled.store(true, Ordering::Release);
            return;
        }
        top.offset += span;
        top.remaining -= span;

        if top.remaining == 0 {
            let _ = top.events.send(DataEvent::Finished);
            if let Some(done) = self.requests.pop() {
                trace!(request = %done.id, "broker: request finished");
            }
            self.awaiting = None;
        }
    }

    fn fail_active(&mut self, err: ChunkStreamError) {
        self.awaiting = None;
        if let Some(active) = self.requests.pop() {
            active.fail(err);
        }
    }
}
