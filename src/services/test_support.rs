//! Shared fixtures for the storage tests.

use crate::{config::StoreConfig, services::storage_service::StorageService};
use bytes::Bytes;
use futures::{Stream, stream};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{io, sync::Arc};

/// A single-connection in-memory database that lives as long as the pool.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    Arc::new(pool)
}

pub async fn memory_store(config: StoreConfig) -> StorageService {
    StorageService::open(memory_pool().await, config)
        .await
        .expect("open store")
}

/// Deterministic, non-repeating-looking test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Yield `data` in pieces of `piece` bytes.
pub fn byte_stream(data: &[u8], piece: usize) -> impl Stream<Item = io::Result<Bytes>> + use<> {
    let pieces: Vec<io::Result<Bytes>> = data
        .chunks(piece)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(pieces)
}

pub async fn count_rows(store: &StorageService, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(&*store.db)
        .await
        .expect("count rows")
}
