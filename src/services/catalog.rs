//! SQLite access for the chunk and metadata catalogs.
//!
//! Both catalogs share one database and are namespaced by a prefix, so several
//! independent stores can live side by side:
//!
//! - `{prefix}_files`   one row per committed file, keyed by `id`
//! - `{prefix}_chunks`  payload rows keyed by `(files_id, n)`
//! - `{prefix}_uploads` marker rows for writes that have not committed yet
//!
//! Table names are interpolated into SQL, so prefixes are restricted to ASCII
//! letters, digits and underscores.

use crate::{
    models::{
        chunk::ChunkSummary,
        file::{FileFilter, FileRecord},
    },
    services::storage_service::{StorageError, StorageResult},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use uuid::Uuid;

const MAX_PREFIX_LEN: usize = 48;

const FILE_COLUMNS: &str =
    "id, filename, content_type, length, chunk_size, upload_date, md5, metadata";

/// Resolved table names for one catalog prefix.
#[derive(Debug, Clone)]
pub(crate) struct CatalogNames {
    pub files: String,
    pub chunks: String,
    pub uploads: String,
    filename_index: String,
}

impl CatalogNames {
    pub fn new(prefix: &str) -> StorageResult<Self> {
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
            return Err(StorageError::Validation(format!(
                "catalog prefix must be between 1 and {} characters",
                MAX_PREFIX_LEN
            )));
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StorageError::Validation(format!(
                "catalog prefix `{}` may only contain ASCII letters, digits and underscores",
                prefix
            )));
        }
        if prefix.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(StorageError::Validation(format!(
                "catalog prefix `{}` must not start with a digit",
                prefix
            )));
        }

        Ok(Self {
            files: format!("{}_files", prefix),
            chunks: format!("{}_chunks", prefix),
            uploads: format!("{}_uploads", prefix),
            filename_index: format!("{}_files_filename_idx", prefix),
        })
    }

    fn schema(&self) -> [String; 4] {
        [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BLOB PRIMARY KEY NOT NULL,
                    filename TEXT NOT NULL,
                    content_type TEXT NOT NULL,
                    length INTEGER NOT NULL,
                    chunk_size INTEGER NOT NULL,
                    upload_date TEXT NOT NULL,
                    md5 TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{{}}'
                )",
                self.files
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (filename, upload_date)",
                self.filename_index, self.files
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    files_id BLOB NOT NULL,
                    n INTEGER NOT NULL,
                    data BLOB NOT NULL,
                    PRIMARY KEY (files_id, n)
                )",
                self.chunks
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    files_id BLOB PRIMARY KEY NOT NULL,
                    started_at TEXT NOT NULL
                )",
                self.uploads
            ),
        ]
    }
}

/// Create the catalog tables if they are missing. Safe to run on every open.
pub(crate) async fn ensure_schema(db: &SqlitePool, names: &CatalogNames) -> StorageResult<()> {
    for stmt in names.schema() {
        tracing::debug!("Executing catalog DDL: {}", stmt);
        sqlx::query(&stmt).execute(db).await?;
    }
    Ok(())
}

/// `(files_id, n) -> bytes` rows plus the pending-upload markers that guard them.
#[derive(Clone)]
pub(crate) struct ChunkCatalog {
    db: Arc<SqlitePool>,
    names: Arc<CatalogNames>,
}

impl ChunkCatalog {
    pub fn new(db: Arc<SqlitePool>, names: Arc<CatalogNames>) -> Self {
        Self { db, names }
    }

    /// Record that chunks for `files_id` are about to be written.
    pub async fn mark_pending(&self, files_id: Uuid) -> StorageResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (files_id, started_at) VALUES (?, ?)",
            self.names.uploads
        ))
        .bind(files_id)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn put(&self, files_id: Uuid, n: i64, data: &[u8]) -> StorageResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (files_id, n, data) VALUES (?, ?, ?)",
            self.names.chunks
        ))
        .bind(files_id)
        .bind(n)
        .bind(data)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn get(&self, files_id: Uuid, n: i64) -> StorageResult<Option<Vec<u8>>> {
        let data = sqlx::query_scalar::<_, Vec<u8>>(&format!(
            "SELECT data FROM {} WHERE files_id = ? AND n = ?",
            self.names.chunks
        ))
        .bind(files_id)
        .bind(n)
        .fetch_optional(&*self.db)
        .await?;
        Ok(data)
    }

    /// Count chunks of `files_id` with a sequence number of at least `n`.
    pub async fn count_from(&self, files_id: Uuid, n: i64) -> StorageResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE files_id = ? AND n >= ?",
            self.names.chunks
        ))
        .bind(files_id)
        .bind(n)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    pub async fn manifest(&self, files_id: Uuid) -> StorageResult<Vec<ChunkSummary>> {
        let rows = sqlx::query_as::<_, ChunkSummary>(&format!(
            "SELECT n, length(data) AS size FROM {} WHERE files_id = ? ORDER BY n ASC",
            self.names.chunks
        ))
        .bind(files_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    pub async fn delete_all(&self, files_id: Uuid) -> StorageResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE files_id = ?", self.names.chunks))
            .bind(files_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop every chunk of an uncommitted write together with its marker.
    pub async fn discard(&self, files_id: Uuid) -> StorageResult<u64> {
        let mut tx = self.db.begin().await?;
        let removed = sqlx::query(&format!("DELETE FROM {} WHERE files_id = ?", self.names.chunks))
            .bind(files_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(&format!("DELETE FROM {} WHERE files_id = ?", self.names.uploads))
            .bind(files_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Remove chunks no committed file owns.
    ///
    /// Writes that started before `stale_before` and never committed are
    /// treated as crashed and reclaimed with their markers. Chunks of younger
    /// pending writes are left alone.
    pub async fn reclaim_orphans(&self, stale_before: DateTime<Utc>) -> StorageResult<u64> {
        let names = &self.names;
        let mut tx = self.db.begin().await?;

        let stale = sqlx::query(&format!(
            "DELETE FROM {chunks} WHERE files_id IN
                (SELECT files_id FROM {uploads} WHERE started_at < ?)",
            chunks = names.chunks,
            uploads = names.uploads
        ))
        .bind(stale_before)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(&format!("DELETE FROM {} WHERE started_at < ?", names.uploads))
            .bind(stale_before)
            .execute(&mut *tx)
            .await?;

        let unowned = sqlx::query(&format!(
            "DELETE FROM {chunks}
             WHERE files_id NOT IN (SELECT id FROM {files})
               AND files_id NOT IN (SELECT files_id FROM {uploads})",
            chunks = names.chunks,
            files = names.files,
            uploads = names.uploads
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(stale + unowned)
    }
}

/// File records keyed by id, searchable by equality filters.
#[derive(Clone)]
pub(crate) struct MetadataCatalog {
    db: Arc<SqlitePool>,
    names: Arc<CatalogNames>,
}

impl MetadataCatalog {
    pub fn new(db: Arc<SqlitePool>, names: Arc<CatalogNames>) -> Self {
        Self { db, names }
    }

    /// Insert the record and clear its pending marker in one transaction.
    ///
    /// The marker must still exist: once reclamation has taken it, the chunks
    /// it guarded are gone and the record is not inserted.
    pub async fn commit(&self, record: &FileRecord) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        let claimed = sqlx::query(&format!(
            "DELETE FROM {} WHERE files_id = ?",
            self.names.uploads
        ))
        .bind(record.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if claimed != 1 {
            tx.rollback().await?;
            return Err(StorageError::NotFound(format!(
                "pending upload `{}` was reclaimed before commit",
                record.id
            )));
        }

        sqlx::query(&format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.names.files, FILE_COLUMNS
        ))
        .bind(record.id)
        .bind(&record.filename)
        .bind(&record.content_type)
        .bind(record.length)
        .bind(record.chunk_size)
        .bind(record.upload_date)
        .bind(&record.md5)
        .bind(&record.metadata)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> StorageResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            FILE_COLUMNS, self.names.files
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Matching records, most recent upload first; later inserts win ties.
    pub async fn find(
        &self,
        filter: &FileFilter,
        limit: Option<i64>,
    ) -> StorageResult<Vec<FileRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            FILE_COLUMNS, self.names.files
        ));

        if let Some(id) = filter.id {
            builder.push(" AND id = ").push_bind(id);
        }
        if let Some(filename) = &filter.filename {
            builder.push(" AND filename = ").push_bind(filename.clone());
        }
        if let Some(content_type) = &filter.content_type {
            builder
                .push(" AND content_type = ")
                .push_bind(content_type.clone());
        }
        if let Some(md5) = &filter.md5 {
            builder.push(" AND md5 = ").push_bind(md5.clone());
        }
        if let Some(length) = filter.length {
            builder.push(" AND length = ").push_bind(length);
        }
        for (key, value) in &filter.metadata {
            builder
                .push(" AND json_extract(metadata, ")
                .push_bind(json_path(key))
                .push(") IS json_extract(")
                .push_bind(value.to_string())
                .push(", '$')");
        }

        builder.push(" ORDER BY upload_date DESC, rowid DESC");
        if let Some(limit) = limit {
            builder.push(" LIMIT ").push_bind(limit);
        }

        let rows = builder
            .build_query_as::<FileRecord>()
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    /// Delete the record and hand it back, or `None` when it did not exist.
    pub async fn remove(&self, id: Uuid) -> StorageResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "DELETE FROM {} WHERE id = ? RETURNING {}",
            self.names.files, FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Touch every catalog table; fails when any of them is unreadable.
    pub async fn probe(&self) -> StorageResult<()> {
        for table in [&self.names.files, &self.names.chunks, &self.names.uploads] {
            sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {} LIMIT 1", table))
                .fetch_one(&*self.db)
                .await?;
        }
        Ok(())
    }
}

/// JSON path addressing a top-level key, quoted so dots stay literal.
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}
