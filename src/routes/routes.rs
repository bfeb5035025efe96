//! Defines routes for the file store.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `GET    /files` — list files (filters: filename, content_type, md5)
//!   - `POST   /files?filename=..` — upload a file from the request body
//!
//! - **File endpoints**
//!   - `GET    /files/{id}` — download content
//!   - `HEAD   /files/{id}` — headers only
//!   - `DELETE /files/{id}` — delete file and chunks
//!   - `GET    /files/{id}/info` — file record as JSON
//!   - `GET    /by-name/{filename}` — download the latest file with that name

use crate::{
    handlers::{
        file_handlers::{
            delete_file, file_info, get_file, get_file_by_name, head_file, list_files,
            upload_file,
        },
        health_handlers::{healthz, readyz},
    },
    services::storage_service::StorageService,
};
use axum::{Router, routing::get};

/// Build and return the router for all file routes.
///
/// The router carries shared state (`StorageService`) to all handlers.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Collection routes
        .route("/files", get(list_files).post(upload_file))
        // File routes
        .route(
            "/files/{id}",
            get(get_file).head(head_file).delete(delete_file),
        )
        .route("/files/{id}/info", get(file_info))
        .route("/by-name/{filename}", get(get_file_by_name))
}
