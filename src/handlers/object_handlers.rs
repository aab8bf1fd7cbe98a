//! HTTP handlers for object operations.
//! Streams object bodies in both directions to avoid buffering in memory and
//! delegates storage concerns to `StorageService`.

use crate::{
    errors::AppError, models::object::ObjectRecord, services::storage_service::StorageService,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::io;
use tokio_util::io::{ReaderStream, StreamReader};

/// Upper bound on records returned by a single listing.
pub const MAX_LIST_ENTRIES: usize = 20;

/// Query params accepted by `GET /objects`.
#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    /// Exclusive lower bound on `lastModifiedUtc`.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `lastModifiedUtc`.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Optional byte window for `GET /objects/{name}`.
#[derive(Debug, Deserialize)]
pub struct ReadObjectQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

/// Starting offset for `POST /objects/{name}`.
#[derive(Debug, Deserialize)]
pub struct UploadObjectQuery {
    pub from: Option<u64>,
}

/// GET `/objects` — newest first, supports ?since=&until=&limit=
pub async fn list_objects(
    State(service): State<StorageService>,
    Query(q): Query<ListObjectsQuery>,
) -> Json<Vec<ObjectRecord>> {
    let limit = q.limit.unwrap_or(MAX_LIST_ENTRIES).min(MAX_LIST_ENTRIES);
    Json(service.list_index(q.since, q.until, limit))
}

/// GET `/objects/{name}/meta` — indexed record only.
pub async fn object_meta(
    State(service): State<StorageService>,
    Path(name): Path<String>,
) -> Result<Json<ObjectRecord>, AppError> {
    service
        .get_index(&name)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("object `{}` not found", name)))
}

/// GET `/objects/{name}` — stream the object, or `[from, to)` of it.
pub async fn get_object(
    State(service): State<StorageService>,
    Path(name): Path<String>,
    Query(q): Query<ReadObjectQuery>,
) -> Result<Response, AppError> {
    let reader = service
        .open_reader(&name, q.from.unwrap_or(0), q.to)
        .await?;
    let len = reader.len();
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

    Ok(response)
}

/// HEAD `/objects/{name}` — headers from the index, no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let record = service
        .get_index(&name)
        .ok_or_else(|| AppError::not_found(format!("object `{}` not found", name)))?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_record_headers(response.headers_mut(), &record);
    Ok(response)
}

/// POST `/objects/{name}?from=` — write the body at `from`, then reindex.
///
/// Responds with the record as it stands after the write.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path(name): Path<String>,
    Query(q): Query<UploadObjectQuery>,
    body: Body,
) -> Result<Json<ObjectRecord>, AppError> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let reader = StreamReader::new(stream);
    tokio::pin!(reader);

    let record = service
        .upload(&name, q.from.unwrap_or(0), &mut reader)
        .await?;
    Ok(Json(record))
}

/// DELETE `/objects/{name}` — drop from the index and delete the payload.
pub async fn delete_object(
    State(service): State<StorageService>,
    Path(name): Path<String>,
) -> Result<Json<ObjectRecord>, AppError> {
    let removed = service.remove(&name).await?;
    Ok(Json(removed))
}

/// POST `/admin/rescan` — rebuild the index from the storage directory.
pub async fn rescan(State(service): State<StorageService>) -> Result<Json<Value>, AppError> {
    let indexed = service.index_all().await?;
    Ok(Json(json!({ "indexed": indexed })))
}

fn set_record_headers(headers: &mut HeaderMap, record: &ObjectRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size));

    let last_modified = record
        .last_modified_utc
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
