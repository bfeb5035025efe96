//! Splits an incoming byte stream into chunks and commits the file record last.
//!
//! A session owns at most one chunk worth of buffered bytes. Full chunks are
//! written as soon as they fill, strictly in sequence order, and the record is
//! only inserted once every chunk write has returned. Any failure rolls the
//! written chunks back, so an aborted write never becomes visible.

use crate::{
    config::MAX_CHUNK_SIZE,
    models::{
        file::{DEFAULT_CONTENT_TYPE, FileRecord},
        upload::WriteOptions,
    },
    services::{
        catalog::{ChunkCatalog, MetadataCatalog},
        checksum::ChecksumAccumulator,
        storage_service::{StorageError, StorageResult},
    },
};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::types::Json;
use std::io;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Number of pending buffers a [`FileWriter`] accepts before `write` waits.
const WRITER_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Committed,
    Aborted,
}

/// An in-progress write of one file.
///
/// Dropping an open session discards its chunks on the current runtime.
pub struct WriteSession {
    id: Uuid,
    filename: String,
    content_type: String,
    chunk_size: usize,
    metadata: Map<String, Value>,
    chunks: ChunkCatalog,
    files: MetadataCatalog,
    buffer: BytesMut,
    checksum: ChecksumAccumulator,
    next_n: i64,
    state: SessionState,
}

impl WriteSession {
    /// Validate `options`, allocate an id and register the pending write.
    pub(crate) async fn begin(
        chunks: ChunkCatalog,
        files: MetadataCatalog,
        options: WriteOptions,
        default_chunk_size: usize,
    ) -> StorageResult<Self> {
        let chunk_size = options.chunk_size.unwrap_or(default_chunk_size);
        ensure_options_valid(&options.filename, chunk_size)?;

        let id = Uuid::new_v4();
        if let Err(err) = chunks.mark_pending(id).await {
            return Err(StorageError::WriteAborted {
                id,
                source: Box::new(err),
            });
        }
        debug!(%id, filename = %options.filename, chunk_size, "write session opened");

        Ok(Self {
            id,
            filename: options.filename,
            content_type: options
                .content_type
                .filter(|ct| !ct.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.into()),
            chunk_size,
            metadata: options.metadata,
            chunks,
            files,
            buffer: BytesMut::with_capacity(chunk_size),
            checksum: ChecksumAccumulator::new(),
            next_n: 0,
            state: SessionState::Open,
        })
    }

    /// Id the file will be committed under.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.checksum.consumed()
    }

    /// Append `data`, writing out every chunk it completes.
    pub async fn write(&mut self, mut data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        self.checksum.update(data);

        while !data.is_empty() {
            let room = self.chunk_size - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buffer.len() == self.chunk_size {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    /// Signal end of input: flush the tail chunk and commit the record.
    pub async fn finish(mut self) -> StorageResult<FileRecord> {
        self.ensure_open()?;
        if !self.buffer.is_empty() {
            self.flush_chunk().await?;
        }

        let length = self.checksum.consumed() as i64;
        let record = FileRecord {
            id: self.id,
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            length,
            chunk_size: self.chunk_size as i64,
            upload_date: Utc::now(),
            md5: std::mem::take(&mut self.checksum).finalize(),
            metadata: Json(std::mem::take(&mut self.metadata)),
        };

        if let Err(err) = self.files.commit(&record).await {
            return Err(self.fail(err).await);
        }
        self.state = SessionState::Committed;
        info!(
            id = %record.id,
            filename = %record.filename,
            length = record.length,
            chunks = self.next_n,
            "file committed"
        );
        Ok(record)
    }

    /// Give up on the write and delete what was stored so far.
    pub async fn abort(mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.state = SessionState::Aborted;
        let removed = self.chunks.discard(self.id).await?;
        debug!(id = %self.id, removed, "write session aborted");
        Ok(())
    }

    /// Abort because of `cause`, returning the error the caller should see.
    pub(crate) async fn fail(&mut self, cause: StorageError) -> StorageError {
        self.state = SessionState::Aborted;
        match self.chunks.discard(self.id).await {
            Ok(removed) => debug!(id = %self.id, removed, "rolled back aborted write"),
            Err(err) => warn!(
                id = %self.id,
                "rollback failed, chunks left for reclamation: {}",
                err
            ),
        }
        StorageError::WriteAborted {
            id: self.id,
            source: Box::new(cause),
        }
    }

    async fn flush_chunk(&mut self) -> StorageResult<()> {
        let chunk = std::mem::replace(&mut self.buffer, BytesMut::with_capacity(self.chunk_size))
            .freeze();
        if let Err(err) = self.chunks.put(self.id, self.next_n, &chunk).await {
            return Err(self.fail(err).await);
        }
        debug!(id = %self.id, n = self.next_n, size = chunk.len(), "chunk written");
        self.next_n += 1;
        Ok(())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Committed => Err(StorageError::Validation(format!(
                "write session for `{}` is already committed",
                self.id
            ))),
            SessionState::Aborted => Err(StorageError::Validation(format!(
                "write session for `{}` was aborted",
                self.id
            ))),
        }
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if self.state != SessionState::Open {
            return;
        }
        let chunks = self.chunks.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = chunks.discard(id).await {
                        warn!(%id, "discarding dropped write failed: {}", err);
                    }
                });
            }
            Err(_) => warn!(%id, "write session dropped outside a runtime, chunks left for reclamation"),
        }
    }
}

/// Reject options before any I/O happens.
fn ensure_options_valid(filename: &str, chunk_size: usize) -> StorageResult<()> {
    if filename.trim().is_empty() {
        return Err(StorageError::Validation("filename is required".into()));
    }
    if chunk_size == 0 {
        return Err(StorageError::Validation(
            "chunk size must be positive".into(),
        ));
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(StorageError::Validation(format!(
            "chunk size {} exceeds maximum {}",
            chunk_size, MAX_CHUNK_SIZE
        )));
    }
    Ok(())
}

enum WriterMessage {
    Data(Bytes),
    Finish,
}

/// Push-style handle over a [`WriteSession`] running on its own task.
///
/// `finish` resolves to the committed record or the error that ended the
/// write. Dropping the handle without calling `finish` aborts the write.
pub struct FileWriter {
    id: Uuid,
    tx: mpsc::Sender<WriterMessage>,
    task: Option<JoinHandle<StorageResult<FileRecord>>>,
}

impl FileWriter {
    pub(crate) fn spawn(session: WriteSession) -> Self {
        let id = session.id();
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let task = tokio::spawn(drive(session, rx));
        Self {
            id,
            tx,
            task: Some(task),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue `data` for writing. Waits while the queue is full.
    ///
    /// When the write has already failed, the failure is returned here and
    /// the handle is spent.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> StorageResult<()> {
        if self.task.is_none() {
            return Err(self.closed());
        }
        if self.tx.send(WriterMessage::Data(data.into())).await.is_ok() {
            return Ok(());
        }
        let result = self.join().await;
        match result {
            Err(err) => Err(err),
            Ok(_) => Err(self.closed()),
        }
    }

    /// End the input and wait for the commit.
    pub async fn finish(mut self) -> StorageResult<FileRecord> {
        if self.task.is_none() {
            return Err(self.closed());
        }
        // A send failure means the task already ended; its result says why.
        let _ = self.tx.send(WriterMessage::Finish).await;
        self.join().await
    }

    async fn join(&mut self) -> StorageResult<FileRecord> {
        let Some(task) = self.task.take() else {
            return Err(self.closed());
        };
        match task.await {
            Ok(result) => result,
            Err(err) => Err(StorageError::WriteAborted {
                id: self.id,
                source: Box::new(StorageError::Source(io::Error::other(err))),
            }),
        }
    }

    fn closed(&self) -> StorageError {
        StorageError::Validation(format!("writer for `{}` is closed", self.id))
    }
}

async fn drive(
    mut session: WriteSession,
    mut rx: mpsc::Receiver<WriterMessage>,
) -> StorageResult<FileRecord> {
    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Data(bytes) => session.write(&bytes).await?,
            WriterMessage::Finish => return session.finish().await,
        }
    }

    Err(session
        .fail(StorageError::Source(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "writer dropped before finish",
        )))
        .await)
}
