//! Record-scoped file operations.
//!
//! `NewFile` is a file that has not been written yet; once written it becomes
//! a `FileRecord`, whose methods read or unlink that one file. Both only
//! forward to `StorageService` with the record's id.

use crate::{
    models::{file::FileRecord, upload::WriteOptions},
    services::{
        read_pipeline::ReadHandle,
        storage_service::{StorageResult, StorageService},
    },
};
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io;

/// Describes a file before its content is written.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewFile {
    pub filename: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewFile {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Write `stream` as this file's content.
    pub async fn write<S>(self, store: &StorageService, stream: S) -> StorageResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        store.write(self.into(), stream).await
    }
}

impl From<NewFile> for WriteOptions {
    fn from(file: NewFile) -> Self {
        WriteOptions {
            filename: file.filename,
            content_type: file.content_type,
            chunk_size: None,
            metadata: file.metadata,
        }
    }
}

impl FileRecord {
    /// Buffer this file's content.
    pub async fn read(&self, store: &StorageService) -> StorageResult<Bytes> {
        store.read_by_id(self.id).await
    }

    /// Open this file for streaming.
    pub async fn open(&self, store: &StorageService) -> StorageResult<ReadHandle> {
        store.open_read(self.id).await
    }

    /// Delete this file, returning the record as it was stored.
    pub async fn unlink(&self, store: &StorageService) -> StorageResult<FileRecord> {
        store.unlink(self.id).await
    }
}
