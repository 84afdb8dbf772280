//! Byte-range transport used by the fetcher.
//!
//! The fetcher only ever needs one thing from the network: a stream of the blob's bytes
//! starting at some offset and running to the end. Dropping the stream cancels the transfer.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::ChunkStreamResult;

/// Bytes of the remote blob, in order, starting at the requested offset.
pub type ByteStream = BoxStream<'static, ChunkStreamResult<Bytes>>;

/// Opens range connections to the remote blob.
#[async_trait]
pub trait RangeTransport: Send + Sync + 'static {
    /// Start streaming the blob from `start` (inclusive) to its end.
    async fn open_stream(&self, start: u64) -> ChunkStreamResult<ByteStream>;
}

#[cfg(feature = "http")]
pub use http::HttpRangeTransport;

#[cfg(feature = "http")]
mod http {
    use std::fmt;

    use async_trait::async_trait;
    use futures_util::{StreamExt, TryStreamExt};
    use reqwest::StatusCode;
    use reqwest::header::{ACCEPT_ENCODING, HeaderMap, HeaderName, HeaderValue, RANGE};
    use tracing::{debug, instrument};
    use url::Url;

    use super::{ByteStream, RangeTransport};
    use crate::error::{ChunkStreamError, ChunkStreamResult};
    use crate::settings::ChunkStreamSettings;

    /// [`RangeTransport`] issuing `GET` requests with an open-ended `Range` header.
    ///
    /// A `206 Partial Content` answer is required, except for requests from offset 0 where a
    /// plain `200 OK` carries the same bytes.
    #[derive(Clone)]
    pub struct HttpRangeTransport {
        client: reqwest::Client,
        url: Url,
        headers: HeaderMap,
        request_timeout: std::time::Duration,
    }

    impl fmt::Debug for HttpRangeTransport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("HttpRangeTransport")
                .field("url", &redact_url_for_logs(&self.url).as_str())
                .field("request_timeout", &self.request_timeout)
                .finish_non_exhaustive()
        }
    }

    impl HttpRangeTransport {
        pub fn new(url: Url, settings: &ChunkStreamSettings) -> ChunkStreamResult<Self> {
            let client = reqwest::Client::builder()
                .connect_timeout(settings.connect_timeout)
                .build()
                .map_err(|e| ChunkStreamError::transport(format_reqwest_error(e)))?;
            Self::with_client(client, url, settings)
        }

        /// Reuse an existing client (connection pool, proxy setup, ...).
        pub fn with_client(
            client: reqwest::Client,
            url: Url,
            settings: &ChunkStreamSettings,
        ) -> ChunkStreamResult<Self> {
            let mut headers = HeaderMap::new();
            for (name, value) in &settings.request_headers {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    ChunkStreamError::InvalidParameters("invalid request header name")
                })?;
                let value = HeaderValue::from_str(value).map_err(|_| {
                    ChunkStreamError::InvalidParameters("invalid request header value")
                })?;
                headers.append(name, value);
            }
            // chunk boundaries are byte offsets into the stored representation
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

            Ok(Self {
                client,
                url,
                headers,
                request_timeout: settings.request_timeout,
            })
        }

        pub fn url(&self) -> &Url {
            &self.url
        }
    }

    #[async_trait]
    impl RangeTransport for HttpRangeTransport {
        #[instrument(skip(self), fields(url = %redact_url_for_logs(&self.url)))]
        async fn open_stream(&self, start: u64) -> ChunkStreamResult<ByteStream> {
            let mut headers = self.headers.clone();
            let range = HeaderValue::from_str(&format!("bytes={start}-"))
                .map_err(|e| ChunkStreamError::transport(e.to_string()))?;
            headers.insert(RANGE, range);

            let send = self.client.get(self.url.clone()).headers(headers).send();
            let resp = tokio::time::timeout(self.request_timeout, send)
                .await
                .map_err(|_| ChunkStreamError::transport("range request timed out"))?
                .map_err(|e| ChunkStreamError::transport(format_reqwest_error(e)))?;

            let status = resp.status();
            let accepted =
                status == StatusCode::PARTIAL_CONTENT || (start == 0 && status == StatusCode::OK);
            if !accepted {
                return Err(ChunkStreamError::HttpStatus {
                    status: status.as_u16(),
                });
            }
            debug!(start, status = status.as_u16(), "transport: range stream opened");

            Ok(resp
                .bytes_stream()
                .map_err(|e| ChunkStreamError::transport(format_reqwest_error(e)))
                .boxed())
        }
    }

    /// Strip credentials, query and fragment; signed URLs carry secrets there.
    fn redact_url_for_logs(url: &Url) -> Url {
        let mut url = url.clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_query(None);
        url.set_fragment(None);
        url
    }

    fn format_reqwest_error(err: reqwest::Error) -> String {
        let mut msg = err.to_string();
        if let Some(url) = err.url() {
            let redacted = redact_url_for_logs(url);
            msg = msg.replace(url.as_str(), redacted.as_str());
        }
        msg
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn redacts_signed_urls() {
            let url = Url::parse("https://user:pw@cdn.example/v/1.bin?sig=abc#t=1").unwrap();
            assert_eq!(
                redact_url_for_logs(&url).as_str(),
                "https://cdn.example/v/1.bin"
            );
        }

        #[test]
        fn rejects_malformed_headers() {
            let settings = ChunkStreamSettings::new().request_header("bad header", "x");
            let url = Url::parse("http://localhost/blob").unwrap();
            assert!(matches!(
                HttpRangeTransport::with_client(reqwest::Client::new(), url, &settings),
                Err(ChunkStreamError::InvalidParameters(_))
            ));
        }

        #[test]
        fn debug_omits_query() {
            let url = Url::parse("http://localhost/blob?token=secret").unwrap();
            let transport =
                HttpRangeTransport::with_client(reqwest::Client::new(), url, &Default::default())
                    .unwrap();
            assert!(!format!("{transport:?}").contains("secret"));
        }
    }
}
