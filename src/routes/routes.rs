//! Defines routes for the upload gateway.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /health`, `/healthz` - liveness
//!   - `GET    /readyz` - backend checks
//!
//! - **Upload sessions**
//!   - `POST   /uploads` - open a session
//!   - `GET    /uploads/{session_id}` - received / missing parts (resume)
//!   - `PUT    /uploads/{session_id}/parts/{index}` - upload one part
//!   - `POST   /uploads/{session_id}/complete` - verify, commit, issue a link
//!   - `POST   /uploads/{session_id}/abort` - discard the session
//!
//! - **Objects**
//!   - `GET    /objects/{*key}?expires=..&signature=..` - signed download
//!
//! The wildcard `*key` allows nested keys like `uploads/2026/03/07/abc.png`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::get_object,
        upload_handlers::{
            abort_upload, complete_upload, create_upload, get_upload, upload_part,
        },
    },
    services::UploadService,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router; shared state is the `UploadService`.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/health", get(healthz))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", post(create_upload))
        .route("/uploads/{session_id}", get(get_upload))
        .route("/uploads/{session_id}/parts/{index}", put(upload_part))
        .route("/uploads/{session_id}/complete", post(complete_upload))
        .route("/uploads/{session_id}/abort", post(abort_upload))
        .route("/objects/{*key}", get(get_object))
}
