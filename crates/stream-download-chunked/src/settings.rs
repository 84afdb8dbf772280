//! Unified configuration for a chunked media session.
//!
//! Included configuration domains:
//! - HTTP range transport (timeouts, extra request headers)
//! - Network fetcher behavior (look-ahead window, event channel depth)
//! - Content metadata reported to the playback host (media kind, explicit MIME type)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::model::MediaKind;

/// Default number of chunks the fetcher may run ahead of the host before it reseeks or stops.
pub const DEFAULT_MAX_LOOKAHEAD: u32 = 10;

/// Unified settings for a chunked media session.
#[derive(Clone)]
pub struct ChunkStreamSettings {
    // ----------------------------
    // HTTP transport
    // ----------------------------
    /// Timeout for establishing the range connection.
    /// Default: 10 seconds.
    pub connect_timeout: Duration,

    /// Timeout for receiving the response headers of a range request. The body itself is
    /// streamed without a deadline.
    /// Default: 30 seconds.
    pub request_timeout: Duration,

    /// Extra headers sent with every range request (e.g. an authorization token).
    ///
    /// Values are not included in Debug output.
    pub request_headers: Vec<(String, String)>,

    // ----------------------------
    // Fetcher
    // ----------------------------
    /// How far (in chunks) the fetcher may stream past the chunk the host is waiting for.
    /// A request further ahead than this reseeks; once the next uncached chunk is this far
    /// ahead of the last request the connection is re-aimed or stopped.
    /// Default: 10.
    pub max_lookahead: u32,

    /// Capacity of the fetcher -> broker event channel.
    /// Default: 32.
    pub event_channel_capacity: usize,

    // ----------------------------
    // Content metadata
    // ----------------------------
    /// Kind of media; selects the default content type.
    pub media_kind: MediaKind,

    /// Explicit MIME type, overriding the one derived from `media_kind`.
    pub content_type: Option<Arc<str>>,
}

impl Default for ChunkStreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            request_headers: Vec::new(),

            max_lookahead: DEFAULT_MAX_LOOKAHEAD,
            event_channel_capacity: 32,

            media_kind: MediaKind::default(),
            content_type: None,
        }
    }
}

impl fmt::Debug for ChunkStreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self
            .request_headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        f.debug_struct("ChunkStreamSettings")
            // Transport
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("request_headers", &header_names)
            // Fetcher
            .field("max_lookahead", &self.max_lookahead)
            .field("event_channel_capacity", &self.event_channel_capacity)
            // Content
            .field("media_kind", &self.media_kind)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl ChunkStreamSettings {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings tuned for mobile networks: shorter timeouts and a shallower look-ahead.
    pub fn mobile(mut self) -> Self {
        self.connect_timeout = Duration::from_secs(5);
        self.request_timeout = Duration::from_secs(15);
        self.max_lookahead = 4;
        self
    }

    /// Content type reported to the host.
    pub fn resolved_content_type(&self) -> Arc<str> {
        self.content_type
            .clone()
            .unwrap_or_else(|| Arc::from(self.media_kind.default_content_type()))
    }

    // -------------------------
    // Transport setters
    // -------------------------

    pub fn connect_timeout(mut self, v: Duration) -> Self {
        self.connect_timeout = v;
        self
    }

    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = v;
        self
    }

    pub fn request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    // -------------------------
    // Fetcher setters
    // -------------------------

    pub fn max_lookahead(mut self, v: u32) -> Self {
        self.max_lookahead = v.max(1);
        self
    }

    pub fn event_channel_capacity(mut self, v: usize) -> Self {
        self.event_channel_capacity = v.max(1);
        self
    }

    // -------------------------
    // Content setters
    // -------------------------

    pub fn media_kind(mut self, v: MediaKind) -> Self {
        self.media_kind = v;
        self
    }

    pub fn content_type(mut self, v: impl Into<Arc<str>>) -> Self {
        self.content_type = Some(v.into());
        self
    }
}
