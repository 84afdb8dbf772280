//! Persistence of per-media cache progress.
//!
//! The engine only needs three operations from the surrounding metadata store: load the last
//! persisted chunk bitmap, save a new one after every chunk write, and record that a media
//! item became fully cached. The bitmap is an opaque blob to the store.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::model::MediaId;

/// Store of chunk bitmaps keyed by [`MediaId`].
///
/// Implementations are called from the cache's write queue and must be safe to call from
/// any thread.
pub trait MetadataStore: Send + Sync + 'static {
    /// Return the last bitmap saved for `media_id`, if any.
    fn load_chunk_bitmap(&self, media_id: &MediaId) -> io::Result<Option<Bytes>>;

    /// Replace the persisted bitmap for `media_id`.
    fn save_chunk_bitmap(&self, media_id: &MediaId, bitmap: Bytes) -> io::Result<()>;

    /// Record that every chunk of `media_id` is cached.
    fn mark_fully_cached(&self, media_id: &MediaId) -> io::Result<()>;
}

/// In-memory [`MetadataStore`]; progress is lost with the process.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    bitmaps: HashMap<MediaId, Bytes>,
    fully_cached: HashMap<MediaId, u32>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a bitmap, e.g. one restored from an earlier session.
    pub fn with_bitmap(self, media_id: impl Into<MediaId>, bitmap: Bytes) -> Self {
        self.inner.lock().bitmaps.insert(media_id.into(), bitmap);
        self
    }

    /// How many times `mark_fully_cached` was called for `media_id`.
    pub fn fully_cached_signals(&self, media_id: &MediaId) -> u32 {
        self.inner
            .lock()
            .fully_cached
            .get(media_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn saved_bitmap(&self, media_id: &MediaId) -> Option<Bytes> {
        self.inner.lock().bitmaps.get(media_id).cloned()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load_chunk_bitmap(&self, media_id: &MediaId) -> io::Result<Option<Bytes>> {
        Ok(self.saved_bitmap(media_id))
    }

    fn save_chunk_bitmap(&self, media_id: &MediaId, bitmap: Bytes) -> io::Result<()> {
        self.inner.lock().bitmaps.insert(media_id.clone(), bitmap);
        Ok(())
    }

    fn mark_fully_cached(&self, media_id: &MediaId) -> io::Result<()> {
        *self
            .inner
            .lock()
            .fully_cached
            .entry(media_id.clone())
            .or_default() += 1;
        Ok(())
    }
}

/// [`MetadataStore`] persisting bitmaps as files under a root directory.
///
/// Layout:
/// - bitmap: `<root>/<media_id>.bitmap`
/// - fully-cached marker: `<root>/<media_id>.complete`
///
/// `<media_id>` is escaped into a single file name (`../x` becomes `%2E%2E%2Fx`). Bitmaps are
/// replaced atomically: the temp file is synced, renamed over the old one and the directory
/// synced, so a crash mid-save leaves either the previous or the new bitmap.
#[derive(Debug)]
pub struct FileMetadataStore {
    root: PathBuf,
    // serializes tmp+rename so concurrent saves never share a temp file
    write_lock: Mutex<()>,
}

impl FileMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bitmap_path(&self, media_id: &MediaId) -> PathBuf {
        self.root.join(format!("{}.bitmap", file_stem(media_id)))
    }

    fn complete_path(&self, media_id: &MediaId) -> PathBuf {
        self.root.join(format!("{}.complete", file_stem(media_id)))
    }

    /// Whether `mark_fully_cached` has ever been recorded for `media_id`.
    pub fn is_fully_cached(&self, media_id: &MediaId) -> bool {
        self.complete_path(media_id).exists()
    }
}

impl MetadataStore for FileMetadataStore {
    fn load_chunk_bitmap(&self, media_id: &MediaId) -> io::Result<Option<Bytes>> {
        match fs::read(self.bitmap_path(media_id)) {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save_chunk_bitmap(&self, media_id: &MediaId, bitmap: Bytes) -> io::Result<()> {
        let path = self.bitmap_path(media_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = tmp_path(&path);
        let res = {
            let _guard = self.write_lock.lock();
            write_synced(&tmp, &bitmap)
                .and_then(|()| fs::rename(&tmp, &path))
                .and_then(|()| sync_dir(&self.root))
        };

        trace!(
            "metadata: save bitmap path='{}' bytes={} ok={}",
            path.display(),
            bitmap.len(),
            res.is_ok()
        );
        res
    }

    fn mark_fully_cached(&self, media_id: &MediaId) -> io::Result<()> {
        let path = self.complete_path(media_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, b"complete=1\n")
    }
}

/// Single path component for `media_id`: bytes outside `[A-Za-z0-9_-]` become `%XX`, so ids
/// like `../x` or `a/b` stay inside the root and never collide with each other.
fn file_stem(media_id: &MediaId) -> String {
    let mut out = String::with_capacity(media_id.as_str().len());
    for byte in media_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_bitmap() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path()).unwrap();
        let id = MediaId::from("post-1/video");

        assert!(store.load_chunk_bitmap(&id).unwrap().is_none());

        let blob = Bytes::from_static(&[3, 0, 0, 0, 0b011]);
        store.save_chunk_bitmap(&id, blob.clone()).unwrap();
        assert_eq!(store.load_chunk_bitmap(&id).unwrap(), Some(blob));

        let newer = Bytes::from_static(&[3, 0, 0, 0, 0b111]);
        store.save_chunk_bitmap(&id, newer.clone()).unwrap();
        assert_eq!(store.load_chunk_bitmap(&id).unwrap(), Some(newer));
        assert!(!tmp_path(&store.bitmap_path(&id)).exists());
    }

    #[test]
    fn media_ids_cannot_leave_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("meta");
        let store = FileMetadataStore::new(&root).unwrap();

        let escaping = MediaId::from("../outside");
        store
            .save_chunk_bitmap(&escaping, Bytes::from_static(&[1, 0, 0, 0, 1]))
            .unwrap();
        store.mark_fully_cached(&escaping).unwrap();

        assert_eq!(store.bitmap_path(&escaping).parent(), Some(root.as_path()));
        assert!(!dir.path().join("outside.bitmap").exists());
        assert!(!dir.path().join("outside.complete").exists());
        assert!(store.is_fully_cached(&escaping));

        // escaping keeps distinct ids apart
        let slash = MediaId::from("a/b");
        let underscore = MediaId::from("a_b");
        assert_ne!(store.bitmap_path(&slash), store.bitmap_path(&underscore));
        assert_eq!(store.bitmap_path(&underscore), root.join("a_b.bitmap"));
    }

    #[test]
    fn file_store_records_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path()).unwrap();
        let id = MediaId::from("clip");
        assert!(!store.is_fully_cached(&id));
        store.mark_fully_cached(&id).unwrap();
        assert!(store.is_fully_cached(&id));
    }

    #[test]
    fn memory_store_counts_signals() {
        let store = MemoryMetadataStore::new();
        let id = MediaId::from("clip");
        assert_eq!(store.fully_cached_signals(&id), 0);
        store.mark_fully_cached(&id).unwrap();
        store.mark_fully_cached(&id).unwrap();
        assert_eq!(store.fully_cached_signals(&id), 2);
    }
}
