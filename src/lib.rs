//! chunk-store — persists byte streams as fixed-size chunks in SQLite and
//! streams them back without holding a whole file in memory.
//!
//! ```no_run
//! use chunk_store::{StorageService, StoreConfig, WriteOptions};
//!
//! # async fn demo() -> Result<(), chunk_store::StorageError> {
//! let store = StorageService::connect("sqlite://./files.db", StoreConfig::default()).await?;
//! let body = futures::stream::iter([Ok(bytes::Bytes::from_static(b"hello"))]);
//! let file = store.write(WriteOptions::new("hello.txt"), body).await?;
//! assert_eq!(store.read_by_id(file.id).await?.as_ref(), b"hello");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use config::StoreConfig;
pub use models::{
    chunk::ChunkSummary,
    file::{FileFilter, FileRecord, FileSelector},
    upload::WriteOptions,
};
pub use services::{
    file_model::NewFile,
    read_pipeline::{ChunkStream, ReadHandle},
    storage_service::{StorageError, StorageResult, StorageService},
    write_pipeline::{FileWriter, WriteSession},
};
