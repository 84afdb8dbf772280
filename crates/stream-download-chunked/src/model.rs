//! Shared value types passed between the host, the broker, the fetcher and the cache.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::ChunkStreamError;

/// Index of a chunk within one media item.
pub type ChunkIndex = u32;

/// Stable identifier of a media item, used as the key into the [`MetadataStore`].
///
/// [`MetadataStore`]: crate::MetadataStore
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaId(pub Arc<str>);

impl MediaId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for MediaId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

/// Kind of media carried by a blob.
///
/// Only used to pick a default content type for [`ContentInfo`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    #[default]
    Video,
}

impl MediaKind {
    /// Default MIME type reported to the playback host.
    pub fn default_content_type(self) -> &'static str {
        match self {
            MediaKind::Image => "image/jpeg",
            MediaKind::Video => "video/mp4",
        }
    }
}

/// Answer to the host's metadata request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub content_type: Arc<str>,
    /// Estimated plaintext length of the whole media item.
    pub content_length: u64,
    pub supports_range_access: bool,
}

/// Identifier of one outstanding host request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request issued by the playback host on the data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRequest {
    /// Content metadata. Hosts should use
    /// [`ChunkedMediaSession::content_info`](crate::ChunkedMediaSession::content_info) instead;
    /// submitted on the data path it fails with `InvalidActiveRequest`.
    ContentInfo,
    /// Plaintext bytes `[offset, offset + length)`.
    Data { offset: u64, length: u64 },
}

/// Progress of one data request, delivered to the host in order.
#[derive(Debug, Clone)]
pub enum DataEvent {
    /// Next slice of the requested range.
    Data(Bytes),
    /// The whole requested range has been delivered.
    Finished,
    /// The request failed; no further events follow.
    Failed(ChunkStreamError),
}
