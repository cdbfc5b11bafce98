//! HTTP handlers for the resumable upload protocol.
//!
//! Part bodies are streamed into the service; everything else is small JSON.

use crate::{
    errors::AppError,
    models::upload::{
        CompleteUploadRequest, CompleteUploadResponse, CreateUploadRequest, CreateUploadResponse,
        PartResponse, SessionStatusResponse,
    },
    services::{
        UploadError, UploadService,
        digest::PartDigest,
        session::{SessionId, SessionSpec},
    },
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State, connect_info::ConnectInfo},
    http::{Extensions, HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::{io, net::SocketAddr, time::Duration};

pub const OWNER_HEADER: &str = "x-upload-owner";
pub const PART_DIGEST_HEADER: &str = "x-part-digest";

/// `POST /uploads`
///
/// The peer address is recorded when the server was started with connect
/// info; in-process callers such as tests have none.
pub async fn create_upload(
    State(service): State<UploadService>,
    extensions: Extensions,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let req: CreateUploadRequest = parse_json(&body)?;
    let owner = header_str(&headers, OWNER_HEADER)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or("anonymous")
        .to_string();
    let uploader_ip = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let session = service
        .create_session(SessionSpec {
            owner,
            content_type: req.content_type,
            total_size: req.total_size,
            part_size: req.part_size,
            filename: req.filename,
            uploader_ip,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUploadResponse {
            session_id: session.id,
            part_size: session.part_size,
            expected_part_count: session.expected_part_count,
            expires_at: session.expires_at,
        }),
    ))
}

/// `GET /uploads/{session_id}`: what has arrived and what is still missing.
pub async fn get_upload(
    State(service): State<UploadService>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, AppError> {
    let session = service.session(parse_session_id(&session_id)?).await?;
    Ok(Json(SessionStatusResponse {
        session_id: session.id,
        status: session.status,
        expected_part_count: session.expected_part_count,
        received_parts: session.received_indices(),
        missing_parts: session.missing_parts(),
        created_at: session.created_at,
        expires_at: session.expires_at,
    }))
}

/// `PUT /uploads/{session_id}/parts/{index}` with the raw part bytes as body.
pub async fn upload_part(
    State(service): State<UploadService>,
    Path((session_id, index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<PartResponse>, AppError> {
    let id = parse_session_id(&session_id)?;
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string);
    let declared = header_str(&headers, PART_DIGEST_HEADER)
        .map(PartDigest::from_hex)
        .transpose()?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let record = service
        .upload_part(id, index, content_type, declared, stream)
        .await?;

    Ok(Json(PartResponse {
        index: record.index,
        etag: record.etag,
        size: record.size,
        digest: record.digest.to_hex(),
    }))
}

/// `POST /uploads/{session_id}/complete`, optionally with a JSON body
/// carrying `declared_digest` and `ttl_secs`.
pub async fn complete_upload(
    State(service): State<UploadService>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<CompleteUploadResponse>, AppError> {
    let id = parse_session_id(&session_id)?;
    let req: CompleteUploadRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CompleteUploadRequest::default()
    } else {
        parse_json(&body)?
    };
    let declared = req
        .declared_digest
        .as_deref()
        .map(PartDigest::from_hex)
        .transpose()?;

    let (result, grant) = service
        .complete(id, declared, req.ttl_secs.map(Duration::from_secs))
        .await?;

    Ok(Json(CompleteUploadResponse {
        object_key: result.object_key,
        digest: result.final_digest,
        size: result.total_size,
        url: grant.url,
        expires_at: grant.expires_at,
    }))
}

/// `POST /uploads/{session_id}/abort`
pub async fn abort_upload(
    State(service): State<UploadService>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    service.abort(parse_session_id(&session_id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

// an id that does not parse cannot name a live session
fn parse_session_id(raw: &str) -> Result<SessionId, AppError> {
    SessionId::parse_str(raw).map_err(|_| UploadError::NotFound(raw.to_string()).into())
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|err| {
        AppError::from(UploadError::InvalidRequest(format!("malformed JSON body: {}", err)))
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
