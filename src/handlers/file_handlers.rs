//! HTTP handlers for file operations.
//! Streams request and response bodies through the chunk pipelines so no
//! file is ever held in memory whole, and delegates storage to `StorageService`.

use crate::{
    errors::AppError,
    models::{
        file::{FileFilter, FileRecord, FileSelector},
        upload::WriteOptions,
    },
    services::{read_pipeline::ReadHandle, storage_service::StorageService},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;
use uuid::Uuid;

/// Query params accepted by `POST /files`.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: Option<String>,
    pub chunk_size: Option<usize>,
}

/// Query params accepted by `GET /files`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub md5: Option<String>,
}

/// `POST /files?filename=..` — store the request body as a new file.
pub async fn upload_file(
    State(service): State<StorageService>,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let filename = q
        .filename
        .ok_or_else(|| AppError::bad_request("query parameter `filename` is required"))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let options = WriteOptions {
        filename,
        content_type,
        chunk_size: q.chunk_size,
        ..WriteOptions::default()
    };
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let file = service.write(options, stream).await?;
    Ok((StatusCode::CREATED, Json(file)))
}

/// `GET /files` — list committed files, most recent first.
pub async fn list_files(
    State(service): State<StorageService>,
    Query(q): Query<ListFilesQuery>,
) -> Result<Json<Vec<FileRecord>>, AppError> {
    let filter = FileFilter {
        filename: q.filename,
        content_type: q.content_type,
        md5: q.md5,
        ..FileFilter::default()
    };
    Ok(Json(service.find(&filter).await?))
}

/// `GET /files/{id}` — stream a file's content.
pub async fn get_file(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let handle = service.open_read(id).await?;
    Ok(stream_response(handle))
}

/// `GET /by-name/{filename}` — stream the most recent file with that name.
pub async fn get_file_by_name(
    State(service): State<StorageService>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let handle = service.open_read(FileSelector::filename(filename)).await?;
    Ok(stream_response(handle))
}

/// `HEAD /files/{id}` — same headers as GET but no body.
pub async fn head_file(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let meta = service.find_by_id(id).await?;
    let mut response = Response::new(Body::empty());
    set_file_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `GET /files/{id}/info` — the file record as JSON.
pub async fn file_info(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(service.find_by_id(id).await?))
}

/// `DELETE /files/{id}` — remove the file and its chunks.
pub async fn delete_file(
    State(service): State<StorageService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let id = service.unlink_by_id(id).await?;
    Ok(Json(json!({ "id": id })))
}

fn stream_response(handle: ReadHandle) -> Response {
    let meta = handle.file().clone();
    let mut response = Response::new(Body::from_stream(handle.into_stream()));
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &meta);
    response
}

fn set_file_headers(headers: &mut HeaderMap, meta: &FileRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.length.max(0)));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.md5)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.upload_date.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
