//! Defines routes for media uploads and asset retrieval.
//!
//! ## Structure
//! - **Uploads** (multipart, bearer auth)
//!   - POST /api/thumbnail/{videoID} -> field `thumbnail`, JPEG or PNG, up to 10 MiB
//!   - POST /api/video/{videoID}     -> field `video`, MP4, up to 1 GiB
//!
//! - **Assets**
//!   - GET /assets/{*key} -> stream a committed asset (keys may be nested,
//!     e.g. `landscape/abc.mp4`)
//!
//! - **Health**
//!   - GET /healthz, GET /readyz

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{get_asset, upload_thumbnail, upload_video},
    },
    services::ingest::AssetKind,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for multipart boundaries and part headers on top of the file itself,
/// so the per-file limit trips before the body limit does.
const MULTIPART_OVERHEAD: u64 = 64 << 10;

fn body_limit(kind: AssetKind) -> DefaultBodyLimit {
    DefaultBodyLimit::max((kind.max_bytes() + MULTIPART_OVERHEAD) as usize)
}

/// Build the router. Shared state (`AppState`) is supplied by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/thumbnail/{video_id}",
            post(upload_thumbnail).layer(body_limit(AssetKind::Thumbnail)),
        )
        .route(
            "/api/video/{video_id}",
            post(upload_video).layer(body_limit(AssetKind::Video)),
        )
        .route("/assets/{*key}", get(get_asset))
}
