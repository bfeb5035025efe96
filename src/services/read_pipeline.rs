//! Reassembles a committed file from its chunks.
//!
//! Chunks are fetched one query at a time in sequence order, so nothing is
//! held open against the database between two pulls and a stream dropped
//! halfway leaves nothing behind. Every chunk is checked against the shape
//! the record promises and the digest is verified after the last one.

use crate::{
    models::file::FileRecord,
    services::{
        catalog::{ChunkCatalog, MetadataCatalog},
        checksum::ChecksumAccumulator,
        storage_service::{StorageError, StorageResult},
    },
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt, stream};
use std::{io, pin::Pin};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use uuid::Uuid;

/// Forward-only sequence of chunk payloads. Ends after the first error.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Upper bound on what `read_all` reserves before any chunk has been checked.
const MAX_PREALLOCATED_CHUNKS: i64 = 16;

/// A resolved file, ready to be read once.
pub struct ReadHandle {
    file: FileRecord,
    chunks: ChunkCatalog,
    files: MetadataCatalog,
}

impl ReadHandle {
    pub(crate) fn new(
        file: FileRecord,
        chunks: ChunkCatalog,
        files: MetadataCatalog,
    ) -> StorageResult<Self> {
        if file.chunk_size <= 0 {
            return Err(corrupted(
                file.id,
                format!("recorded chunk size {} is not positive", file.chunk_size),
            ));
        }
        if file.length < 0 {
            return Err(corrupted(
                file.id,
                format!("recorded length {} is negative", file.length),
            ));
        }
        Ok(Self {
            file,
            chunks,
            files,
        })
    }

    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    /// Buffer the whole content in memory.
    pub async fn read_all(self) -> StorageResult<Bytes> {
        // The recorded length is not trusted until the chunks back it up.
        let cap = self
            .file
            .length
            .min(self.file.chunk_size.saturating_mul(MAX_PREALLOCATED_CHUNKS));
        let capacity = usize::try_from(cap).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(capacity);
        let mut stream = self.into_stream();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub fn into_stream(self) -> ChunkStream {
        let cursor = ChunkCursor {
            total: self.file.expected_chunks(),
            file: self.file,
            chunks: self.chunks,
            files: self.files,
            next_n: 0,
            checksum: ChecksumAccumulator::new(),
        };

        Box::pin(stream::unfold(Some(cursor), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next_chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes), Some(cursor))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        }))
    }

    /// Expose the content through `tokio::io::AsyncRead`.
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.into_stream().map_err(io::Error::other))
    }
}

struct ChunkCursor {
    file: FileRecord,
    chunks: ChunkCatalog,
    files: MetadataCatalog,
    total: i64,
    next_n: i64,
    checksum: ChecksumAccumulator,
}

impl ChunkCursor {
    async fn next_chunk(&mut self) -> StorageResult<Option<Bytes>> {
        if self.next_n == self.total {
            self.verify_tail().await?;
            return Ok(None);
        }

        let n = self.next_n;
        let Some(data) = self.chunks.get(self.file.id, n).await? else {
            return Err(self.missing_chunk(n).await);
        };

        let expected = self.file.expected_chunk_len(n);
        if data.len() as i64 != expected {
            return Err(corrupted(
                self.file.id,
                format!("chunk {} holds {} bytes, expected {}", n, data.len(), expected),
            ));
        }

        self.checksum.update(&data);
        self.next_n += 1;
        Ok(Some(Bytes::from(data)))
    }

    /// A chunk of a file deleted mid-read is gone together with its record.
    async fn missing_chunk(&self, n: i64) -> StorageError {
        match self.files.get(self.file.id).await {
            Ok(None) => StorageError::NotFound(format!(
                "file `{}` was deleted while being read",
                self.file.id
            )),
            Ok(Some(_)) => corrupted(
                self.file.id,
                format!("chunk {} of {} is missing", n, self.total),
            ),
            Err(err) => err,
        }
    }

    async fn verify_tail(&mut self) -> StorageResult<()> {
        let extra = self.chunks.count_from(self.file.id, self.total).await?;
        if extra > 0 {
            return Err(corrupted(
                self.file.id,
                format!("{} unexpected chunks past sequence {}", extra, self.total),
            ));
        }

        let digest = std::mem::take(&mut self.checksum).finalize();
        if digest != self.file.md5 {
            return Err(corrupted(
                self.file.id,
                format!("md5 {} does not match recorded {}", digest, self.file.md5),
            ));
        }
        Ok(())
    }
}

fn corrupted(id: Uuid, reason: String) -> StorageError {
    StorageError::Corrupted { id, reason }
}
