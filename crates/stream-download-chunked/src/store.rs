//! Durable cache of decrypted chunks.
//!
//! A [`ChunkStore`] maps one media item onto a single sparse file: chunk `i` lives at
//! `i * regular_chunk_pt_size`. Which chunks are present is tracked by a [`ChunkBitmap`] that
//! is restored from, and saved back to, the [`MetadataStore`] so a partial download survives
//! process restarts.
//!
//! Concurrency:
//! - the file handle and the bitmap sit behind one `parking_lot::Mutex`; `is_cached` and
//!   `read_chunk` take it synchronously and are bounded by a single seek + read;
//! - writes coming from the network go through a [`ChunkWriteQueue`], a single task that
//!   performs one write at a time on the blocking pool, so concurrent completions can never
//!   race on the same index or interleave bitmap updates.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::bitmap::ChunkBitmap;
use crate::error::{ChunkStreamError, ChunkStreamResult};
use crate::metadata::MetadataStore;
use crate::model::{ChunkIndex, MediaId};
use crate::params::ChunkedMediaParameters;

/// Snapshot of cache progress for one media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    pub total_chunks: ChunkIndex,
    pub cached_chunks: ChunkIndex,
    pub fully_cached: bool,
}

/// File-backed random-access store of decrypted chunks.
///
/// Cheap to clone; all clones share the same file handle and bitmap.
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    params: ChunkedMediaParameters,
    media_id: MediaId,
    path: PathBuf,
    metadata: Arc<dyn MetadataStore>,
    state: Mutex<StoreState>,
}

struct StoreState {
    file: Option<File>,
    bitmap: ChunkBitmap,
    /// Plaintext length of the final chunk once it has been written.
    tail_pt_len: Option<u64>,
    fully_cached_signalled: bool,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("media_id", &self.inner.media_id)
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl ChunkStore {
    /// Open (or create) the cache file at `path` and restore progress for `media_id`.
    ///
    /// A persisted bitmap that does not match `params`, or that claims chunks the file cannot
    /// hold, is discarded and the cache starts empty.
    pub fn open(
        path: impl AsRef<Path>,
        params: ChunkedMediaParameters,
        media_id: MediaId,
        metadata: Arc<dyn MetadataStore>,
    ) -> ChunkStreamResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let total = params.total_chunk_count();
        let bitmap = match metadata.load_chunk_bitmap(&media_id) {
            Ok(Some(raw)) => match ChunkBitmap::from_bytes(&raw, total) {
                Some(bitmap) => bitmap,
                None => {
                    warn!(
                        media_id = %media_id,
                        expected_chunks = total,
                        "cache: persisted bitmap does not match media geometry, starting empty"
                    );
                    ChunkBitmap::new(total)
                }
            },
            Ok(None) => ChunkBitmap::new(total),
            Err(e) => {
                warn!(media_id = %media_id, "cache: failed to load bitmap ({e}), starting empty");
                ChunkBitmap::new(total)
            }
        };
        let (bitmap, tail_pt_len) = reconcile_with_file(bitmap, &params, file_len, &media_id);

        let fully_cached_signalled = bitmap.is_complete();
        debug!(
            media_id = %media_id,
            path = %path.display(),
            cached = bitmap.count_ones(),
            total,
            "cache: opened"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                params,
                media_id,
                path,
                metadata,
                state: Mutex::new(StoreState {
                    file: Some(file),
                    bitmap,
                    tail_pt_len,
                    fully_cached_signalled,
                }),
            }),
        })
    }

    pub fn params(&self) -> &ChunkedMediaParameters {
        &self.inner.params
    }

    pub fn media_id(&self) -> &MediaId {
        &self.inner.media_id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_cached(&self, index: ChunkIndex) -> bool {
        self.inner.state.lock().bitmap.get(index)
    }

    /// First uncached chunk at or after `from`; `total_chunk_count` if none remain.
    pub fn next_uncached_index(&self, from: ChunkIndex) -> ChunkIndex {
        self.inner.state.lock().bitmap.next_unset_from(from)
    }

    pub fn cached_chunk_count(&self) -> ChunkIndex {
        self.inner.state.lock().bitmap.count_ones()
    }

    pub fn is_fully_cached(&self) -> bool {
        self.inner.state.lock().bitmap.is_complete()
    }

    pub fn status(&self) -> CacheStatus {
        let state = self.inner.state.lock();
        CacheStatus {
            total_chunks: state.bitmap.len(),
            cached_chunks: state.bitmap.count_ones(),
            fully_cached: state.bitmap.is_complete(),
        }
    }

    /// Read the decrypted bytes of a cached chunk.
    pub fn read_chunk(&self, index: ChunkIndex) -> ChunkStreamResult<Bytes> {
        let params = &self.inner.params;
        params.check_index(index)?;

        let mut state = self.inner.state.lock();
        if !state.bitmap.get(index) {
            return Err(ChunkStreamError::NotCached(index));
        }
        let len = if params.is_final_chunk(index) {
            state
                .tail_pt_len
                .unwrap_or_else(|| params.chunk_pt_size(index))
        } else {
            params.regular_chunk_pt_size()
        };
        let file = state.file.as_mut().ok_or(ChunkStreamError::Closed)?;

        let mut buf = vec![0u8; len as usize];
        file.seek(SeekFrom::Start(params.chunk_pt_offset(index)))?;
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Durably write chunk `index` and record it in the bitmap.
    ///
    /// Writing an already cached chunk is a no-op. The bitmap bit is only set once the data
    /// has been synced to disk.
    pub fn write_chunk(&self, index: ChunkIndex, data: &[u8]) -> ChunkStreamResult<()> {
        let params = &self.inner.params;
        params.check_index(index)?;

        let mut state = self.inner.state.lock();
        if state.bitmap.get(index) {
            trace!(media_id = %self.inner.media_id, index, "cache: chunk already present");
            return Ok(());
        }

        let is_final = params.is_final_chunk(index);
        if !is_final && data.len() as u64 != params.regular_chunk_pt_size() {
            return Err(ChunkStreamError::PlaintextSizeMismatch {
                chunk_index: index,
                expected: params.regular_chunk_pt_size(),
                actual: data.len() as u64,
            });
        }

        let offset = params.chunk_pt_offset(index);
        {
            let file = state.file.as_mut().ok_or(ChunkStreamError::Closed)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            if is_final {
                // drop stale bytes past the true end left by an earlier, discarded cache
                file.set_len(offset + data.len() as u64)?;
            }
            file.sync_data()?;
        }

        state.bitmap.set(index);
        if is_final {
            state.tail_pt_len = Some(data.len() as u64);
        }
        trace!(
            media_id = %self.inner.media_id,
            index,
            bytes = data.len(),
            cached = state.bitmap.count_ones(),
            "cache: chunk written"
        );

        let media_id = &self.inner.media_id;
        if let Err(e) = self
            .inner
            .metadata
            .save_chunk_bitmap(media_id, state.bitmap.to_bytes())
        {
            // the chunk is durable; the next successful save persists the full bitmap again
            warn!(media_id = %media_id, index, "cache: failed to persist bitmap: {e}");
        }

        if state.bitmap.is_complete() && !state.fully_cached_signalled {
            state.fully_cached_signalled = true;
            debug!(media_id = %media_id, "cache: fully cached");
            if let Err(e) = self.inner.metadata.mark_fully_cached(media_id) {
                warn!(media_id = %media_id, "cache: failed to record full cache: {e}");
            }
        }

        Ok(())
    }

    /// Release the file handle. Safe to call repeatedly and from any thread; later reads and
    /// writes fail with [`ChunkStreamError::Closed`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.file.take().is_some() {
            debug!(media_id = %self.inner.media_id, "cache: closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().file.is_none()
    }

    fn write_if_uncached(&self, index: ChunkIndex, data: &[u8]) -> WriteOutcome {
        let result = if self.is_cached(index) {
            Ok(())
        } else {
            self.write_chunk(index, data)
        };
        WriteOutcome {
            index,
            next_uncached: self.next_uncached_index(index),
            result,
        }
    }
}

/// Drop bitmap bits the cache file cannot back, and recover the final chunk's length.
fn reconcile_with_file(
    mut bitmap: ChunkBitmap,
    params: &ChunkedMediaParameters,
    file_len: u64,
    media_id: &MediaId,
) -> (ChunkBitmap, Option<u64>) {
    let last = params.final_chunk_index();
    let tail_start = params.chunk_pt_offset(last);

    let regular_end = (0..last)
        .rev()
        .find(|&i| bitmap.get(i))
        .map(|i| params.chunk_pt_offset(i) + params.regular_chunk_pt_size())
        .unwrap_or(0);
    let tail_ok = !bitmap.get(last) || file_len >= tail_start;

    if file_len < regular_end || !tail_ok {
        warn!(
            media_id = %media_id,
            file_len,
            "cache: file is shorter than the persisted bitmap claims, starting empty"
        );
        bitmap = ChunkBitmap::new(params.total_chunk_count());
    }

    let tail_pt_len = bitmap
        .get(last)
        .then(|| file_len.saturating_sub(tail_start));
    (bitmap, tail_pt_len)
}

/// Result of a queued write, delivered back to whoever submitted it.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub index: ChunkIndex,
    /// First uncached chunk at or after `index` after the write.
    pub next_uncached: ChunkIndex,
    pub result: ChunkStreamResult<()>,
}

struct WriteJob {
    index: ChunkIndex,
    data: Bytes,
    reply: mpsc::UnboundedSender<WriteOutcome>,
}

/// Single-writer queue in front of a [`ChunkStore`].
///
/// Jobs run strictly one after another; the queue task exits once every handle is dropped.
#[derive(Clone)]
pub struct ChunkWriteQueue {
    jobs: mpsc::UnboundedSender<WriteJob>,
}

impl ChunkWriteQueue {
    /// Spawn the writer task on the current tokio runtime.
    pub fn spawn(store: ChunkStore) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_write_queue(store, rx));
        Self { jobs }
    }

    /// Queue `data` for chunk `index` unless it is already cached. The outcome is sent to
    /// `reply` once the write has been attempted.
    pub fn write_chunk_if_uncached(
        &self,
        index: ChunkIndex,
        data: Bytes,
        reply: mpsc::UnboundedSender<WriteOutcome>,
    ) {
        if let Err(err) = self.jobs.send(WriteJob { index, data, reply }) {
            let job = err.0;
            let _ = job.reply.send(WriteOutcome {
                index: job.index,
                next_uncached: job.index,
                result: Err(ChunkStreamError::Closed),
            });
        }
    }
}

async fn run_write_queue(store: ChunkStore, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
    while let Some(job) = jobs.recv().await {
        let WriteJob { index, data, reply } = job;
        let worker = store.clone();
        let task = tokio::task::spawn_blocking(move || worker.write_if_uncached(index, &data));
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => WriteOutcome {
                index,
                next_uncached: store.next_uncached_index(index),
                result: Err(ChunkStreamError::io(format!("chunk write task failed: {e}"))),
            },
        };
        if reply.send(outcome).is_err() {
            trace!(index, "cache: write outcome dropped, submitter is gone");
        }
    }
    trace!(media_id = %store.media_id(), "cache: write queue finished");
}
