//! End-to-end tests of chunked streaming against a local range server.
//!
//! Covers:
//! - AES-128-CBC blobs read through the whole stack, including the zero-padded tail
//! - arbitrary ranges (chunk-spanning, clamped past the estimate)
//! - resuming from a persisted bitmap (full and partial)
//! - seek-ahead reseeking on a throttled connection
//! - close and HTTP failure propagation

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use stream_download_chunked::{
    ChunkStreamError, ChunkStreamSettings, ChunkedMediaSession, ChunkedMediaSource, DataEvent,
    FileMetadataStore, MediaId, MemoryMetadataStore, MetadataStore, PassthroughDecryptor,
};
use stream_download_chunked_tests::{RangeBlobServer, init_tracing, plaintext, test_cipher};

const CHUNK_SIZE: u64 = 512;
const PLAINTEXT_LEN: usize = 5000;
// 10 full chunks of 496 plaintext bytes plus a 40-byte tail padded to 48
const BLOB_SIZE: u64 = 10 * 512 + 48;
const ESTIMATE: u64 = 10 * 496 + 47;

const STEP: Duration = Duration::from_secs(10);

fn aes_blob() -> Vec<u8> {
    test_cipher()
        .encrypt_blob(&plaintext(PLAINTEXT_LEN), CHUNK_SIZE as usize)
        .expect("chunk size fits whole AES blocks")
}

/// What the host sees: the true plaintext followed by zeros up to the estimate.
fn padded_plaintext() -> Vec<u8> {
    let mut pt = plaintext(PLAINTEXT_LEN);
    pt.resize(ESTIMATE as usize, 0);
    pt
}

fn aes_source(dir: &Path) -> ChunkedMediaSource {
    ChunkedMediaSource {
        media_id: MediaId::from("aes-clip"),
        blob_size: BLOB_SIZE,
        chunk_size: CHUNK_SIZE,
        cache_path: dir.join("aes-clip.cache"),
    }
}

async fn open_aes(
    server: &RangeBlobServer,
    dir: &Path,
    metadata: Arc<dyn MetadataStore>,
) -> ChunkedMediaSession {
    ChunkedMediaSession::open_http(
        server.blob_url(),
        aes_source(dir),
        &ChunkStreamSettings::default(),
        metadata,
        Box::new(test_cipher()),
    )
    .await
    .expect("failed to open session")
}

async fn read(session: &ChunkedMediaSession, offset: u64, length: u64) -> Vec<u8> {
    tokio::time::timeout(STEP, session.request_data(offset, length).read_to_end())
        .await
        .expect("read timed out")
        .expect("read failed")
        .to_vec()
}

#[tokio::test]
async fn aes_blob_streams_with_padded_tail() {
    init_tracing();
    let server = RangeBlobServer::start(aes_blob()).await;
    let dir = tempfile::tempdir().unwrap();
    let session = open_aes(&server, dir.path(), Arc::new(MemoryMetadataStore::new())).await;

    let info = session.content_info();
    assert_eq!(info.content_length, ESTIMATE);
    assert_eq!(&*info.content_type, "video/mp4");

    let bytes = read(&session, 0, ESTIMATE).await;
    assert_eq!(bytes.len() as u64, ESTIMATE);
    assert_eq!(&bytes[..PLAINTEXT_LEN], &plaintext(PLAINTEXT_LEN)[..]);
    assert!(bytes[PLAINTEXT_LEN..].iter().all(|&b| b == 0));

    assert!(session.status().fully_cached);
    assert_eq!(server.range_starts(), vec![0]);
    let telemetry = session.telemetry();
    assert_eq!(telemetry.connections_opened, 1);
    assert_eq!(telemetry.chunks_decrypted, 11);
    assert_eq!(telemetry.bytes_received, BLOB_SIZE);
}

#[rstest]
#[case::first_byte(0, 1)]
#[case::across_chunk_boundary(495, 2)]
#[case::several_chunks(1000, 2000)]
#[case::into_the_padding(4990, 17)]
#[case::clamped_to_estimate(4999, 100)]
#[tokio::test]
async fn arbitrary_ranges(#[case] offset: u64, #[case] length: u64) {
    init_tracing();
    let server = RangeBlobServer::start(aes_blob()).await;
    let dir = tempfile::tempdir().unwrap();
    let session = open_aes(&server, dir.path(), Arc::new(MemoryMetadataStore::new())).await;

    let end = (offset + length).min(ESTIMATE);
    let expected = &padded_plaintext()[offset as usize..end as usize];
    assert_eq!(read(&session, offset, length).await, expected);
}

#[tokio::test]
async fn out_of_range_offset_fails() {
    init_tracing();
    let server = RangeBlobServer::start(aes_blob()).await;
    let dir = tempfile::tempdir().unwrap();
    let session = open_aes(&server, dir.path(), Arc::new(MemoryMetadataStore::new())).await;

    let err = session
        .request_data(ESTIMATE, 10)
        .read_to_end()
        .await
        .unwrap_err();
    assert!(matches!(err, ChunkStreamError::OutOfRange { .. }));
    assert_eq!(server.request_count(), 0);
}

#[tokio::test]
async fn fully_cached_media_is_served_offline() {
    init_tracing();
    let server = RangeBlobServer::start(aes_blob()).await;
    let cache_dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(FileMetadataStore::new(cache_dir.path().join("meta")).unwrap());

    {
        let session = open_aes(&server, cache_dir.path(), metadata.clone()).await;
        let _ = read(&session, 0, ESTIMATE).await;
        session.close();
    }
    assert!(metadata.is_fully_cached(&MediaId::from("aes-clip")));
    let after_first = server.request_count();
    assert_eq!(after_first, 1);

    let session = open_aes(&server, cache_dir.path(), metadata.clone()).await;
    assert!(session.status().fully_cached);
    assert_eq!(read(&session, 0, ESTIMATE).await, padded_plaintext());
    assert_eq!(read(&session, 3000, 5).await, &padded_plaintext()[3000..3005]);
    assert_eq!(server.request_count(), after_first);
}

#[tokio::test]
async fn partial_cache_resumes_past_the_cached_prefix() {
    init_tracing();
    // ~20ms per 64 bytes so the first session cannot finish the blob before it is closed
    let server = RangeBlobServer::start_with(aes_blob(), 64, Duration::from_millis(20)).await;
    let cache_dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(FileMetadataStore::new(cache_dir.path().join("meta")).unwrap());

    {
        let session = open_aes(&server, cache_dir.path(), metadata.clone()).await;
        let _ = read(&session, 0, 2 * 496).await;
        session.close();
    }
    assert!(!metadata.is_fully_cached(&MediaId::from("aes-clip")));
    let first_session_requests = server.request_count();

    let session = open_aes(&server, cache_dir.path(), metadata.clone()).await;
    let cached = session.status().cached_chunks;
    assert!(cached >= 2, "expected the first two chunks to be restored, got {cached}");

    assert_eq!(read(&session, 0, ESTIMATE).await, padded_plaintext());

    let resumed = &server.range_starts()[first_session_requests..];
    assert!(!resumed.is_empty());
    assert!(resumed.iter().all(|&start| start > 0 && start % CHUNK_SIZE == 0));
    assert_eq!(resumed[0], u64::from(cached) * CHUNK_SIZE);
}

#[tokio::test]
async fn far_seek_opens_a_new_range() {
    init_tracing();
    const CHUNK: u64 = 64;
    let blob = plaintext(40 * CHUNK as usize);
    let server = RangeBlobServer::start_with(blob.clone(), 32, Duration::from_millis(10)).await;
    let dir = tempfile::tempdir().unwrap();

    let session = ChunkedMediaSession::open_http(
        server.blob_url(),
        ChunkedMediaSource {
            media_id: MediaId::from("plain"),
            blob_size: blob.len() as u64,
            chunk_size: CHUNK,
            cache_path: dir.path().join("plain.cache"),
        },
        &ChunkStreamSettings::default(),
        Arc::new(MemoryMetadataStore::new()),
        Box::new(PassthroughDecryptor),
    )
    .await
    .unwrap();

    assert_eq!(read(&session, 0, 10).await, &blob[..10]);
    let seek_to = 30 * CHUNK;
    assert_eq!(read(&session, seek_to + 5, 100).await, &blob[seek_to as usize + 5..][..100]);

    let starts = server.range_starts();
    assert_eq!(starts[0], 0);
    assert!(starts.contains(&seek_to), "range starts: {starts:?}");
    assert!(session.telemetry().reseeks >= 1);
}

#[tokio::test]
async fn close_cancels_pending_requests() {
    init_tracing();
    let server = RangeBlobServer::start_with(aes_blob(), 16, Duration::from_millis(300)).await;
    let dir = tempfile::tempdir().unwrap();
    let session = open_aes(&server, dir.path(), Arc::new(MemoryMetadataStore::new())).await;

    let mut request = session.request_data(0, 1000);
    session.close();

    let event = tokio::time::timeout(STEP, request.next_event())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, DataEvent::Failed(ChunkStreamError::Cancelled)));
    assert!(request.next_event().await.is_none());
}

#[tokio::test]
async fn missing_blob_reports_http_status() {
    init_tracing();
    let server = RangeBlobServer::start(aes_blob()).await;
    let dir = tempfile::tempdir().unwrap();
    let session = ChunkedMediaSession::open_http(
        server.url_for("missing"),
        aes_source(dir.path()),
        &ChunkStreamSettings::default(),
        Arc::new(MemoryMetadataStore::new()),
        Box::new(test_cipher()),
    )
    .await
    .unwrap();

    let err = tokio::time::timeout(STEP, session.request_data(0, 10).read_to_end())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ChunkStreamError::HttpStatus { status: 404 }), "{err}");
}

#[tokio::test]
async fn server_ignoring_ranges_is_rejected_mid_blob() {
    init_tracing();
    let server = RangeBlobServer::start(aes_blob()).await;
    let dir = tempfile::tempdir().unwrap();
    let session = ChunkedMediaSession::open_http(
        server.url_for("norange"),
        aes_source(dir.path()),
        &ChunkStreamSettings::default(),
        Arc::new(MemoryMetadataStore::new()),
        Box::new(test_cipher()),
    )
    .await
    .unwrap();

    let err = tokio::time::timeout(STEP, session.request_data(5 * 496, 10).read_to_end())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ChunkStreamError::HttpStatus { status: 200 }), "{err}");
}
