//! Data models for the media-ingest service.
//!
//! Records map to SQLite rows via `sqlx::FromRow` and serialize as JSON
//! via `serde`.

pub mod video;
