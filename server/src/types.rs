//! Shared record types for the StatusHub server.
//!
//! Records are immutable once created by the event store. The serialized
//! field names match the wire format used by existing StatusHub clients.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One logged message from a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Name of the service that produced the message.
    #[serde(rename = "serviceName")]
    pub service: String,

    /// The message text.
    pub message: String,

    /// Creation time in unix seconds.
    #[serde(rename = "time")]
    pub timestamp: i64,

    /// Store-wide record identifier.
    pub id: u64,
}

impl LogRecord {
    pub(crate) fn new(id: u64, service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
            timestamp: unix_now(),
            id,
        }
    }
}

/// A media blob kept in the store's bounded media cache.
///
/// The payload is shared, so cloning a record for a snapshot never copies
/// the bytes. Listings serialize only the metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRecord {
    /// Folder the media belongs to.
    pub folder: String,

    /// Original file name.
    pub filename: String,

    /// MIME type reported by the uploader.
    #[serde(rename = "mime")]
    pub mime_type: String,

    /// Creation time in unix seconds.
    #[serde(rename = "time")]
    pub timestamp: i64,

    /// Store-wide record identifier.
    pub id: u64,

    /// Raw media bytes.
    #[serde(skip)]
    pub data: Arc<[u8]>,
}

impl MediaRecord {
    pub(crate) fn new(
        id: u64,
        folder: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            folder: folder.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            timestamp: unix_now(),
            id,
            data: Arc::from(data),
        }
    }

    /// Size of the payload in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The unit a streaming consumer subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every service's messages.
    Global,

    /// One service's messages.
    Service(String),
}

impl Scope {
    /// Creates a scope for a single service.
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(name.into())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Service(name) => write!(f, "service:{name}"),
        }
    }
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}
