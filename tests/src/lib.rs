//! Shared fixtures for the `stream-download-chunked` integration tests.
//!
//! [`RangeBlobServer`] is a local axum server holding one blob and answering `Range:
//! bytes=N-` requests the way a CDN would. Responses are streamed in small fragments, with an
//! optional delay per fragment, so the fetcher sees realistic partial reads.
//!
//! Routes:
//! - `/blob`: range-aware (`206`, or `200` without a `Range` header)
//! - `/norange`: ignores `Range` and always answers `200` with the whole blob
//! - anything else: `404`

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;
use url::Url;

use stream_download_chunked::Aes128CbcChunkCipher;

pub const TEST_KEY: [u8; 16] = *b"0123456789abcdef";
pub const TEST_IV: [u8; 16] = [7u8; 16];

/// Install a `tracing` subscriber once per test binary. Filter with `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .with_line_number(false)
            .with_file(false)
            .try_init();
    });
}

/// Deterministic plaintext of `len` bytes.
pub fn plaintext(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn test_cipher() -> Aes128CbcChunkCipher {
    Aes128CbcChunkCipher::new(TEST_KEY, TEST_IV)
}

#[derive(Clone)]
struct ServerState {
    blob: Bytes,
    fragment_size: usize,
    fragment_delay: Duration,
    range_starts: Arc<Mutex<Vec<u64>>>,
}

pub struct RangeBlobServer {
    base: Url,
    range_starts: Arc<Mutex<Vec<u64>>>,
}

impl RangeBlobServer {
    /// Serve `blob` in 128-byte fragments without delay.
    pub async fn start(blob: impl Into<Bytes>) -> Self {
        Self::start_with(blob, 128, Duration::ZERO).await
    }

    pub async fn start_with(
        blob: impl Into<Bytes>,
        fragment_size: usize,
        fragment_delay: Duration,
    ) -> Self {
        let range_starts = Arc::new(Mutex::new(Vec::new()));
        let state = ServerState {
            blob: blob.into(),
            fragment_size: fragment_size.max(1),
            fragment_delay,
            range_starts: range_starts.clone(),
        };

        let app = Router::new()
            .route(
                "/blob",
                get({
                    let state = state.clone();
                    move |headers: HeaderMap| serve_range(state.clone(), headers)
                }),
            )
            .route(
                "/norange",
                get({
                    let state = state.clone();
                    move || serve_whole(state.clone())
                }),
            );

        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("failed to bind local fixture server");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking on fixture listener");
        let addr = listener.local_addr().expect("fixture listener addr");

        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener)
                .expect("failed to convert fixture listener to tokio listener");
            axum::serve(listener, app).await.expect("fixture server failed");
        });

        Self {
            base: Url::parse(&format!("http://{addr}/")).expect("failed to build base url"),
            range_starts,
        }
    }

    pub fn blob_url(&self) -> Url {
        self.url_for("blob")
    }

    pub fn url_for(&self, path: &str) -> Url {
        self.base.join(path).expect("fixture url")
    }

    /// Start offsets of every request to `/blob`, in arrival order.
    pub fn range_starts(&self) -> Vec<u64> {
        self.range_starts.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.range_starts().len()
    }
}

fn parse_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    if !end.is_empty() {
        return None;
    }
    start.parse().ok()
}

async fn serve_range(state: ServerState, headers: HeaderMap) -> Response {
    let start = match headers.get(header::RANGE) {
        None => None,
        Some(_) => match parse_range_start(&headers) {
            Some(start) => Some(start),
            None => return StatusCode::BAD_REQUEST.into_response(),
        },
    };
    if let Ok(mut starts) = state.range_starts.lock() {
        starts.push(start.unwrap_or(0));
    }

    let total = state.blob.len() as u64;
    let Some(start) = start else {
        return body_response(&state, StatusCode::OK, state.blob.clone());
    };
    if start >= total {
        let mut resp = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
        resp.headers_mut().insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes */{total}")).expect("content-range"),
        );
        return resp;
    }

    let mut resp = body_response(
        &state,
        StatusCode::PARTIAL_CONTENT,
        state.blob.slice(start as usize..),
    );
    resp.headers_mut().insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {start}-{}/{total}", total - 1))
            .expect("content-range"),
    );
    resp
}

async fn serve_whole(state: ServerState) -> Response {
    body_response(&state, StatusCode::OK, state.blob.clone())
}

fn body_response(state: &ServerState, status: StatusCode, body: Bytes) -> Response {
    let len = body.len();
    let fragments: Vec<Bytes> = (0..len)
        .step_by(state.fragment_size)
        .map(|i| body.slice(i..(i + state.fragment_size).min(len)))
        .collect();
    let delay = state.fragment_delay;
    let stream = futures_util::stream::iter(fragments).then(move |fragment| async move {
        if delay != Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        Ok::<Bytes, std::io::Error>(fragment)
    });

    let mut resp = Response::new(Body::from_stream(stream));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    resp.headers_mut().insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&len.to_string()).expect("content-length"),
    );
    resp
}
