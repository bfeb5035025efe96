//! Represents the chunks a file's content is split into.

use serde::Serialize;
use sqlx::FromRow;

/// Position and size of one stored chunk, without its payload.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Zero-based sequence number within the file.
    pub n: i64,

    /// Payload size in bytes.
    pub size: i64,
}
