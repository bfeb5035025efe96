//! Core data models for the chunked file store.
//!
//! A file is described by one record in the metadata catalog and its bytes
//! are spread over ordered chunks in the chunk catalog. The records map to
//! database rows via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod chunk;
pub mod file;
pub mod upload;
