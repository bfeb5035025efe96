//! Parameters for starting a chunked upload.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Options accepted when a write session begins.
///
/// Only `filename` is required. Unset fields fall back to the store
/// defaults when the session is opened.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WriteOptions {
    /// Name recorded on the committed file.
    pub filename: String,

    /// Content type; `application/octet-stream` when absent.
    pub content_type: Option<String>,

    /// Chunk size in bytes; the store's default when absent.
    pub chunk_size: Option<usize>,

    /// Auxiliary fields copied onto the committed record.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl WriteOptions {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
