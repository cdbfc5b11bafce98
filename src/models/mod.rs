//! Data models for the upload gateway.
//!
//! `object` maps to the SQLite `objects` table via `sqlx::FromRow`; the rest
//! are JSON bodies of the HTTP API and values passed between services.

pub mod metadata;
pub mod object;
pub mod upload;
