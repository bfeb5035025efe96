//! src/services/storage_service.rs
//!
//! StorageService — the store handle. Files are written as ordered chunks
//! into `{prefix}_chunks` and described by one row in `{prefix}_files` that is
//! inserted only after the last chunk is durable. Reads resolve that row and
//! stream the chunks back; deletes remove the row first and the chunks after.

use crate::{
    config::{MAX_CHUNK_SIZE, StoreConfig},
    models::{
        chunk::ChunkSummary,
        file::{FileFilter, FileRecord, FileSelector},
        upload::WriteOptions,
    },
    services::{
        catalog::{self, CatalogNames, ChunkCatalog, MetadataCatalog},
        read_pipeline::ReadHandle,
        write_pipeline::{FileWriter, WriteSession},
    },
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::{Stream, StreamExt, pin_mut};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{io, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("file `{id}` is corrupted: {reason}")]
    Corrupted { id: Uuid, reason: String },
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("write of file `{id}` aborted: {source}")]
    WriteAborted {
        id: Uuid,
        #[source]
        source: Box<StorageError>,
    },
    #[error("source stream failed: {0}")]
    Source(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// StorageService exposes the chunked file operations:
/// - Write a file from a byte stream, or through a push-style writer
/// - Read a file by id or filename, buffered or as a lazy stream
/// - Find, list and delete file records
///
/// The handle is cheap to clone; clones share the pool and catalogs.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool backing both catalogs.
    pub db: Arc<SqlitePool>,

    config: StoreConfig,
    chunks: ChunkCatalog,
    files: MetadataCatalog,
}

impl StorageService {
    /// Open a store over `db`, creating its catalogs when missing.
    pub async fn open(db: Arc<SqlitePool>, config: StoreConfig) -> StorageResult<Self> {
        if config.default_chunk_size == 0 || config.default_chunk_size > MAX_CHUNK_SIZE {
            return Err(StorageError::Validation(format!(
                "default chunk size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        let names = Arc::new(CatalogNames::new(&config.catalog_prefix)?);
        catalog::ensure_schema(&db, &names).await?;
        debug!(prefix = %config.catalog_prefix, "catalogs ready");

        Ok(Self {
            chunks: ChunkCatalog::new(db.clone(), names.clone()),
            files: MetadataCatalog::new(db.clone(), names),
            db,
            config,
        })
    }

    /// Connect to the SQLite database at `url` and open a store on it.
    pub async fn connect(url: &str, config: StoreConfig) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::open(Arc::new(db), config).await
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Start a write session. Options are validated before anything is stored.
    pub async fn begin_write(&self, options: WriteOptions) -> StorageResult<WriteSession> {
        WriteSession::begin(
            self.chunks.clone(),
            self.files.clone(),
            options,
            self.config.default_chunk_size,
        )
        .await
    }

    /// Store everything `stream` yields as one file and return its record.
    ///
    /// An error from the stream aborts the write like a storage error does.
    pub async fn write<S>(&self, options: WriteOptions, stream: S) -> StorageResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let mut session = self.begin_write(options).await?;
        pin_mut!(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => session.write(&bytes).await?,
                Err(err) => return Err(session.fail(StorageError::Source(err)).await),
            }
        }
        session.finish().await
    }

    /// Start a write fed through the returned handle.
    pub async fn writer(&self, options: WriteOptions) -> StorageResult<FileWriter> {
        let session = self.begin_write(options).await?;
        Ok(FileWriter::spawn(session))
    }

    /// Resolve `selector` to a committed file ready to be read.
    pub async fn open_read(&self, selector: impl Into<FileSelector>) -> StorageResult<ReadHandle> {
        let file = match selector.into() {
            FileSelector::Id(id) => self.find_by_id(id).await?,
            FileSelector::Filter(filter) => self.find_one(&filter).await?,
        };
        ReadHandle::new(file, self.chunks.clone(), self.files.clone())
    }

    pub async fn read_by_id(&self, id: Uuid) -> StorageResult<Bytes> {
        self.open_read(id).await?.read_all().await
    }

    /// Content of the most recently committed file named `filename`.
    pub async fn read_by_name(&self, filename: &str) -> StorageResult<Bytes> {
        self.open_read(FileSelector::filename(filename))
            .await?
            .read_all()
            .await
    }

    pub async fn find_by_id(&self, id: Uuid) -> StorageResult<FileRecord> {
        self.files
            .get(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("file `{}`", id)))
    }

    /// The most recently committed file matching `filter`.
    ///
    /// Files with equal upload dates resolve to the one committed last.
    pub async fn find_one(&self, filter: &FileFilter) -> StorageResult<FileRecord> {
        self.files
            .find(filter, Some(1))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound(describe(filter)))
    }

    /// Every file matching `filter`, most recent first.
    pub async fn find(&self, filter: &FileFilter) -> StorageResult<Vec<FileRecord>> {
        self.files.find(filter, None).await
    }

    /// Delete a file and return its id.
    pub async fn delete_by_id(&self, id: Uuid) -> StorageResult<Uuid> {
        self.unlink(id).await.map(|file| file.id)
    }

    pub async fn unlink_by_id(&self, id: Uuid) -> StorageResult<Uuid> {
        self.delete_by_id(id).await
    }

    /// Delete a file and return the record it had.
    ///
    /// The record goes first: once it is gone the file is unreachable, and a
    /// failure while removing chunks only leaves orphans behind for
    /// `reclaim_orphaned_chunks`.
    pub async fn unlink(&self, id: Uuid) -> StorageResult<FileRecord> {
        let file = self
            .files
            .remove(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("file `{}`", id)))?;

        match self.chunks.delete_all(id).await {
            Ok(removed) => info!(%id, filename = %file.filename, removed, "file deleted"),
            Err(err) => warn!(
                %id,
                "file record deleted but chunk removal failed, left for reclamation: {}",
                err
            ),
        }
        Ok(file)
    }

    /// Sequence numbers and sizes of the chunks stored under `id`.
    pub async fn chunk_manifest(&self, id: Uuid) -> StorageResult<Vec<ChunkSummary>> {
        self.chunks.manifest(id).await
    }

    /// Delete chunks that no committed file owns.
    ///
    /// Writes still in progress are spared unless they started more than
    /// `grace` ago, in which case they are presumed crashed.
    pub async fn reclaim_orphaned_chunks(&self, grace: Duration) -> StorageResult<u64> {
        let removed = self.chunks.reclaim_orphans(Utc::now() - grace).await?;
        if removed > 0 {
            info!(removed, "reclaimed orphaned chunks");
        }
        Ok(removed)
    }

    /// Check that every catalog table answers queries.
    pub async fn probe(&self) -> StorageResult<()> {
        self.files.probe().await
    }
}

fn describe(filter: &FileFilter) -> String {
    match (&filter.filename, filter.id) {
        (_, Some(id)) => format!("file `{}`", id),
        (Some(name), None) => format!("file named `{}`", name),
        (None, None) => "matching file".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{checksum::digest, test_support::*};
    use futures::stream;

    #[tokio::test]
    async fn round_trip_preserves_content_and_checksum() {
        let store = memory_store(StoreConfig::default().with_chunk_size(4)).await;

        for len in [0usize, 1, 3, 4, 5, 17] {
            let data = pattern(len);
            let file = store
                .write(WriteOptions::new("data.bin"), byte_stream(&data, 3))
                .await
                .unwrap();
            assert_eq!(file.length, len as i64);
            assert_eq!(file.md5, digest(&data));

            let read = store.read_by_id(file.id).await.unwrap();
            assert_eq!(read.as_ref(), data.as_slice());
            assert_eq!(digest(&read), file.md5);
        }
    }

    #[tokio::test]
    async fn committed_record_carries_defaults_and_metadata() {
        let store = memory_store(StoreConfig::default()).await;
        let file = store
            .write(
                WriteOptions::new("text.txt").metadata("owner", "ops"),
                byte_stream(b"hello", 2),
            )
            .await
            .unwrap();

        assert_eq!(file.filename, "text.txt");
        assert_eq!(file.content_type, "application/octet-stream");
        assert_eq!(file.chunk_size, crate::config::DEFAULT_CHUNK_SIZE as i64);
        assert_eq!(file.metadata.get("owner"), Some(&serde_json::json!("ops")));

        let found = store.find_by_id(file.id).await.unwrap();
        assert_eq!(found.id, file.id);
        assert_eq!(found.md5, file.md5);
        assert_eq!(found.upload_date, file.upload_date);
        assert_eq!(found.metadata.0, file.metadata.0);
    }

    #[tokio::test]
    async fn chunks_are_contiguous_and_only_the_last_is_short() {
        let store = memory_store(StoreConfig::default()).await;

        for (len, chunk_size) in [(0usize, 4usize), (4, 4), (10, 4), (12, 4), (7, 1)] {
            let data = pattern(len);
            let file = store
                .write(
                    WriteOptions::new("c.bin").chunk_size(chunk_size),
                    byte_stream(&data, 5),
                )
                .await
                .unwrap();

            let manifest = store.chunk_manifest(file.id).await.unwrap();
            assert_eq!(manifest.len(), len.div_ceil(chunk_size));
            for (i, chunk) in manifest.iter().enumerate() {
                assert_eq!(chunk.n, i as i64);
                if i + 1 < manifest.len() {
                    assert_eq!(chunk.size, chunk_size as i64);
                } else {
                    assert!(chunk.size > 0 && chunk.size <= chunk_size as i64);
                }
            }
            let total: i64 = manifest.iter().map(|c| c.size).sum();
            assert_eq!(total, file.length);
        }
    }

    #[tokio::test]
    async fn validation_fails_before_any_io() {
        let store = memory_store(StoreConfig::default()).await;
        let err = store
            .write(WriteOptions::new(""), byte_stream(b"abc", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));

        assert!(matches!(
            store
                .begin_write(WriteOptions::new("a").chunk_size(0))
                .await,
            Err(StorageError::Validation(_))
        ));

        assert_eq!(count_rows(&store, "fs_uploads").await, 0);
    }

    #[tokio::test]
    async fn failed_source_leaves_nothing_visible() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let items = vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"ef")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away")),
        ];

        let err = store
            .write(WriteOptions::new("broken.bin"), stream::iter(items))
            .await
            .unwrap_err();

        let (id, source) = match err {
            StorageError::WriteAborted { id, source } => (id, source),
            other => panic!("expected WriteAborted, got {other:?}"),
        };
        assert!(matches!(*source, StorageError::Source(_)));
        assert!(matches!(
            store.find_by_id(id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(store.chunk_manifest(id).await.unwrap().is_empty());
        assert_eq!(count_rows(&store, "fs_uploads").await, 0);
    }

    #[tokio::test]
    async fn storage_failure_mid_write_aborts() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let mut session = store.begin_write(WriteOptions::new("x.bin")).await.unwrap();
        let id = session.id();
        session.write(b"abcd").await.unwrap();
        assert_eq!(store.chunk_manifest(id).await.unwrap().len(), 2);

        sqlx::query("DROP TABLE fs_chunks")
            .execute(&*store.db)
            .await
            .unwrap();

        let err = session.write(b"ef").await.unwrap_err();
        assert!(matches!(err, StorageError::WriteAborted { id: aborted, .. } if aborted == id));
        assert!(matches!(
            session.write(b"gh").await,
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            store.find_by_id(id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn explicit_abort_discards_written_chunks() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let mut session = store.begin_write(WriteOptions::new("y.bin")).await.unwrap();
        let id = session.id();
        session.write(b"abcde").await.unwrap();
        assert_eq!(session.bytes_written(), 5);
        session.abort().await.unwrap();

        assert!(store.chunk_manifest(id).await.unwrap().is_empty());
        assert!(matches!(
            store.find_by_id(id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn uncommitted_write_is_invisible() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let mut session = store.begin_write(WriteOptions::new("z.bin")).await.unwrap();
        let id = session.id();
        session.write(b"abcd").await.unwrap();

        assert!(matches!(
            store.find_by_id(id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.find_one(&FileFilter::by_filename("z.bin")).await,
            Err(StorageError::NotFound(_))
        ));

        let file = session.finish().await.unwrap();
        assert_eq!(store.find_by_id(id).await.unwrap().id, file.id);
    }

    #[tokio::test]
    async fn delete_cascades_and_double_delete_is_not_found() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let file = store
            .write(WriteOptions::new("gone.txt"), byte_stream(b"abcdef", 4))
            .await
            .unwrap();

        assert_eq!(store.unlink_by_id(file.id).await.unwrap(), file.id);
        assert!(matches!(
            store.find_by_id(file.id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.read_by_id(file.id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(store.chunk_manifest(file.id).await.unwrap().is_empty());
        assert!(matches!(
            store.unlink_by_id(file.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_filenames_resolve_to_the_latest() {
        let store = memory_store(StoreConfig::default()).await;
        let first = store
            .write(WriteOptions::new("same.txt"), byte_stream(b"first", 8))
            .await
            .unwrap();
        let second = store
            .write(WriteOptions::new("same.txt"), byte_stream(b"second", 8))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let found = store
            .find_one(&FileFilter::by_filename("same.txt"))
            .await
            .unwrap();
        assert_eq!(found.id, second.id);
        assert_eq!(store.read_by_name("same.txt").await.unwrap().as_ref(), b"second");

        let all = store.find(&FileFilter::by_filename("same.txt")).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        store.delete_by_id(second.id).await.unwrap();
        assert_eq!(store.read_by_name("same.txt").await.unwrap().as_ref(), b"first");
    }

    #[tokio::test]
    async fn find_filters_on_fields_and_metadata() {
        let store = memory_store(StoreConfig::default()).await;
        let report = store
            .write(
                WriteOptions::new("report.pdf")
                    .content_type("application/pdf")
                    .metadata("owner", "ops")
                    .metadata("pages", 3),
                byte_stream(b"%PDF", 4),
            )
            .await
            .unwrap();
        store
            .write(
                WriteOptions::new("notes.txt")
                    .content_type("text/plain")
                    .metadata("owner", "dev"),
                byte_stream(b"notes", 4),
            )
            .await
            .unwrap();

        let by_type = FileFilter {
            content_type: Some("application/pdf".into()),
            ..FileFilter::default()
        };
        assert_eq!(store.find_one(&by_type).await.unwrap().id, report.id);

        let by_owner = FileFilter::default().with_metadata("owner", "ops");
        assert_eq!(store.find_one(&by_owner).await.unwrap().id, report.id);

        let by_pages = FileFilter::default().with_metadata("pages", 3);
        assert_eq!(store.find_one(&by_pages).await.unwrap().id, report.id);

        let by_md5 = FileFilter {
            md5: Some(report.md5.clone()),
            ..FileFilter::default()
        };
        assert_eq!(store.find(&by_md5).await.unwrap().len(), 1);

        let nobody = FileFilter::default().with_metadata("owner", "nobody");
        assert!(matches!(
            store.find_one(&nobody).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(store.find(&FileFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn prefixes_isolate_stores() {
        let db = memory_pool().await;
        let fs = StorageService::open(db.clone(), StoreConfig::default())
            .await
            .unwrap();
        let attachments = StorageService::open(db, StoreConfig::new("attachments"))
            .await
            .unwrap();

        let file = attachments
            .write(WriteOptions::new("a.txt"), byte_stream(b"abc", 2))
            .await
            .unwrap();
        assert!(matches!(
            fs.find_by_id(file.id).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(attachments.read_by_id(file.id).await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn open_rejects_bad_config() {
        let db = memory_pool().await;
        assert!(matches!(
            StorageService::open(db.clone(), StoreConfig::new("bad-prefix")).await,
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            StorageService::open(db, StoreConfig::default().with_chunk_size(0)).await,
            Err(StorageError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn reclaim_spares_in_flight_writes() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let kept = store
            .write(WriteOptions::new("kept.bin"), byte_stream(b"abcd", 4))
            .await
            .unwrap();

        let mut session = store.begin_write(WriteOptions::new("live.bin")).await.unwrap();
        session.write(b"abcd").await.unwrap();

        let orphan = Uuid::new_v4();
        sqlx::query("INSERT INTO fs_chunks (files_id, n, data) VALUES (?, 0, ?)")
            .bind(orphan)
            .bind(&b"zz"[..])
            .execute(&*store.db)
            .await
            .unwrap();

        let removed = store
            .reclaim_orphaned_chunks(Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.chunk_manifest(session.id()).await.unwrap().len(), 2);
        assert_eq!(store.read_by_id(kept.id).await.unwrap().as_ref(), b"abcd");

        let live = session.finish().await.unwrap();
        assert_eq!(store.read_by_id(live.id).await.unwrap().as_ref(), b"abcd");
    }

    #[tokio::test]
    async fn reclaim_collects_stale_pending_writes() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let mut session = store.begin_write(WriteOptions::new("crash.bin")).await.unwrap();
        let id = session.id();
        session.write(b"abcdef").await.unwrap();
        // Simulate a crash: the session never finishes and is never dropped.
        std::mem::forget(session);

        let removed = store
            .reclaim_orphaned_chunks(Duration::seconds(-1))
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert!(store.chunk_manifest(id).await.unwrap().is_empty());
        assert_eq!(count_rows(&store, "fs_uploads").await, 0);
    }

    #[tokio::test]
    async fn reclaimed_session_cannot_commit() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let mut session = store.begin_write(WriteOptions::new("slow.bin")).await.unwrap();
        let id = session.id();
        session.write(b"abcd").await.unwrap();

        let removed = store
            .reclaim_orphaned_chunks(Duration::seconds(-1))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let err = session.finish().await.unwrap_err();
        assert!(matches!(err, StorageError::WriteAborted { id: aborted, .. } if aborted == id));
        assert!(matches!(
            store.find_by_id(id).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(count_rows(&store, "fs_files").await, 0);
    }

    #[tokio::test]
    async fn dropped_session_is_rolled_back() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let mut session = store.begin_write(WriteOptions::new("drop.bin")).await.unwrap();
        let id = session.id();
        session.write(b"abcd").await.unwrap();
        drop(session);

        for _ in 0..50 {
            if store.chunk_manifest(id).await.unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.chunk_manifest(id).await.unwrap().is_empty());
        assert_eq!(count_rows(&store, "fs_uploads").await, 0);
    }

    #[tokio::test]
    async fn writer_handle_commits_on_finish() {
        let store = memory_store(StoreConfig::default().with_chunk_size(3)).await;
        let mut writer = store
            .writer(WriteOptions::new("pushed.txt").content_type("text/plain"))
            .await
            .unwrap();
        let id = writer.id();
        writer.write(&b"hello "[..]).await.unwrap();
        writer.write(Bytes::from_static(b"world")).await.unwrap();
        let file = writer.finish().await.unwrap();

        assert_eq!(file.id, id);
        assert_eq!(file.length, 11);
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(store.read_by_id(id).await.unwrap().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn dropped_writer_aborts() {
        let store = memory_store(StoreConfig::default().with_chunk_size(2)).await;
        let mut writer = store.writer(WriteOptions::new("dropped.txt")).await.unwrap();
        let id = writer.id();
        writer.write(&b"abcdef"[..]).await.unwrap();
        drop(writer);

        for _ in 0..50 {
            if count_rows(&store, "fs_uploads").await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(store.chunk_manifest(id).await.unwrap().is_empty());
        assert!(matches!(
            store.find_by_id(id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn probe_reports_missing_catalog() {
        let store = memory_store(StoreConfig::default()).await;
        store.probe().await.unwrap();
        sqlx::query("DROP TABLE fs_uploads")
            .execute(&*store.db)
            .await
            .unwrap();
        assert!(matches!(
            store.probe().await,
            Err(StorageError::Unavailable(_))
        ));
    }
}
