//! Represents a logical file whose content is stored as a sequence of chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{FromRow, types::Json};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type recorded when the writer does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A committed file in the metadata catalog.
///
/// A record only exists once every chunk of the file has been written and
/// the length and checksum are final. The struct describes the file; the
/// content itself lives in the chunk catalog keyed by `id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// Unique identifier, allocated when the write begins.
    pub id: Uuid,

    /// Name supplied by the writer. Several files may share a name.
    pub filename: String,

    /// Content type (MIME type).
    pub content_type: String,

    /// Total size in bytes.
    pub length: i64,

    /// Size of every chunk except possibly the last.
    pub chunk_size: i64,

    /// When the file was committed.
    pub upload_date: DateTime<Utc>,

    /// Lowercase hex MD5 of the full content.
    pub md5: String,

    /// Caller-supplied auxiliary fields, stored verbatim.
    pub metadata: Json<Map<String, Value>>,
}

impl FileRecord {
    /// Number of chunks a consistent file of this shape is made of.
    pub fn expected_chunks(&self) -> i64 {
        if self.length <= 0 || self.chunk_size <= 0 {
            0
        } else {
            self.length / self.chunk_size + i64::from(self.length % self.chunk_size != 0)
        }
    }

    /// Byte length chunk `n` must have.
    pub fn expected_chunk_len(&self, n: i64) -> i64 {
        if n + 1 == self.expected_chunks() {
            self.length - n * self.chunk_size
        } else {
            self.chunk_size
        }
    }
}

/// Equality filter over file records.
///
/// Every populated field must match. `metadata` entries are compared against
/// the top-level keys of the stored metadata object.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FileFilter {
    pub id: Option<Uuid>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub md5: Option<String>,
    pub length: Option<i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl FileFilter {
    pub fn by_filename(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// How a reader designates the file it wants.
#[derive(Clone, Debug)]
pub enum FileSelector {
    Id(Uuid),
    /// Resolves to the most recently committed match.
    Filter(FileFilter),
}

impl FileSelector {
    pub fn filename(filename: impl Into<String>) -> Self {
        Self::Filter(FileFilter::by_filename(filename))
    }
}

impl From<Uuid> for FileSelector {
    fn from(id: Uuid) -> Self {
        Self::Id(id)
    }
}

impl From<FileFilter> for FileSelector {
    fn from(filter: FileFilter) -> Self {
        Self::Filter(filter)
    }
}
