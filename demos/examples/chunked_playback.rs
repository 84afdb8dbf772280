//! Stream a chunked blob over HTTP the way a player would: content info first, then
//! sequential 64 KiB reads, then a seek back into the cached region.
//!
//! ```text
//! cargo run -p stream-download-chunked-demos --example chunked_playback -- \
//!     <url> <blob_size> <chunk_size> [cache_dir]
//! ```
//!
//! Set `CHUNKED_KEY` and `CHUNKED_IV` (32 hex digits each) for AES-128-CBC blobs; without
//! them the blob is treated as plaintext. Run it twice with the same `cache_dir` to see the
//! second run served from disk.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use stream_download_chunked::{
    Aes128CbcChunkCipher, ChunkDecryptor, ChunkStreamSettings, ChunkedMediaSession,
    ChunkedMediaSource, DataEvent, FileMetadataStore, MediaId, PassthroughDecryptor,
};
use tracing::info;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;
use url::Url;

const READ_SIZE: u64 = 64 * 1024;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::default()
                .add_directive("stream_download_chunked=debug".parse()?)
                .add_directive(LevelFilter::INFO.into()),
        )
        .with_line_number(false)
        .with_file(false)
        .init();

    let mut args = std::env::args().skip(1);
    let usage = "usage: chunked_playback <url> <blob_size> <chunk_size> [cache_dir]";
    let url = Url::parse(&args.next().ok_or(usage)?)?;
    let blob_size: u64 = args.next().ok_or(usage)?.parse()?;
    let chunk_size: u64 = args.next().ok_or(usage)?.parse()?;
    let cache_dir = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("stream-download-chunked-demo"));

    let decryptor: Box<dyn ChunkDecryptor> =
        match (std::env::var("CHUNKED_KEY"), std::env::var("CHUNKED_IV")) {
            (Ok(key), Ok(iv)) => {
                Box::new(Aes128CbcChunkCipher::new(parse_hex(&key)?, parse_hex(&iv)?))
            }
            _ => Box::new(PassthroughDecryptor),
        };

    let media_id = MediaId::from(
        url.path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("media"),
    );
    let source = ChunkedMediaSource {
        cache_path: cache_dir.join(format!("{media_id}.cache")),
        media_id,
        blob_size,
        chunk_size,
    };
    let metadata = Arc::new(FileMetadataStore::new(cache_dir.join("meta"))?);
    let settings = ChunkStreamSettings::new().mobile();

    let session =
        ChunkedMediaSession::open_http(url, source, &settings, metadata, decryptor).await?;
    let info = session.content_info();
    info!(
        content_type = %info.content_type,
        content_length = info.content_length,
        cached = ?session.status(),
        "content info"
    );

    let started = Instant::now();
    let mut offset = 0;
    while offset < info.content_length {
        let mut request = session.request_data(offset, READ_SIZE);
        while let Some(event) = request.next_event().await {
            match event {
                DataEvent::Data(bytes) => offset += bytes.len() as u64,
                DataEvent::Finished => break,
                DataEvent::Failed(e) => return Err(e.into()),
            }
        }
        info!(offset, elapsed = ?started.elapsed(), "read");
    }

    let seek = info.content_length / 3;
    let bytes = session.request_data(seek, 1024).read_to_end().await?;
    info!(seek, len = bytes.len(), "seek back served");
    info!(telemetry = ?session.telemetry(), status = ?session.status(), "done");

    session.close();
    Ok(())
}

fn parse_hex(value: &str) -> Result<[u8; 16], Box<dyn Error + Send + Sync>> {
    let value = value.trim();
    if value.len() != 32 || !value.is_ascii() {
        return Err(format!("expected 32 hex digits, got {}", value.len()).into());
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&value[2 * i..2 * i + 2], 16)?;
    }
    Ok(out)
}
