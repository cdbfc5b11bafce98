//! Retrieval of committed objects through signed links.
//! Streams object bodies to avoid buffering in memory.

use crate::{
    errors::AppError,
    models::object::StoredObject,
    services::{UploadError, UploadService},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

/// Query string of a signed link.
#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

/// `GET /objects/{*key}?expires=..&signature=..` as a streaming response.
pub async fn get_object(
    State(service): State<UploadService>,
    Path(key): Path<String>,
    Query(q): Query<SignedQuery>,
) -> Result<Response, AppError> {
    let (Some(expires), Some(signature)) = (q.expires, q.signature) else {
        return Err(UploadError::GrantRejected("link is missing expires or signature".into()).into());
    };

    let (meta, reader) = service.open_signed(&key, expires, &signature).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.uploaded_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.content_digest) {
        headers.insert(HeaderName::from_static("x-content-digest"), value);
    }
    if let Some(name) = meta.filename.as_deref() {
        let safe: String = name
            .chars()
            .filter(|c| (c.is_ascii_graphic() && *c != '"' && *c != '\\') || *c == ' ')
            .collect();
        if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{}\"", safe)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
}
