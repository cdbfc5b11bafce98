//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness delegated to the storage backend's probes

use crate::{backend::CheckStatus, services::UploadService};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;

/// `GET /healthz`
///
/// Always 200; never touches storage.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// HTTP 200 when every backend probe passes, 503 otherwise. The body lists
/// each probe with its error, if any.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let checks = service.readiness().await;
    let overall_ok = checks.iter().all(|c| c.ok);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        live_sessions: service.registry().len().await,
        checks: checks.into_iter().map(|c| (c.name, c)).collect(),
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    live_sessions: usize,
    checks: BTreeMap<&'static str, CheckStatus>,
}
