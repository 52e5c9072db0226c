use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::{
    config::AppConfig,
    services::{
        asset_store::{
            AssetStore, InlineAssetStore, LocalAssetStore, RemoteAssetStore, StorageBackend,
        },
        auth::JwtAuthenticator,
        classifier::{FfprobeProber, MediaClassifier},
        ingest::{AssetStores, IngestService},
        record_store::SqliteRecordStore,
        stager::AssetStager,
    },
    state::AppState,
};

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        thumbnail_backend = %cfg.thumbnail_backend,
        video_backend = %cfg.video_backend,
        staging_dir = %cfg.staging_dir.display(),
        "Starting media-ingest"
    );

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Ensure staging directory exists ---
    tokio::fs::create_dir_all(&cfg.staging_dir)
        .await
        .with_context(|| format!("creating staging directory {}", cfg.staging_dir.display()))?;

    // --- Initialize services ---
    let assets = build_asset_stores(&cfg).await?;
    let prober = FfprobeProber::new(&cfg.ffprobe_path, cfg.probe_timeout);
    let ingest = IngestService::new(
        Arc::new(JwtAuthenticator::new(&cfg.jwt_secret)),
        Arc::new(SqliteRecordStore::new(db.clone())),
        assets.clone(),
        MediaClassifier::new(Arc::new(prober)),
        AssetStager::new(&cfg.staging_dir),
    );

    let state = AppState {
        ingest: Arc::new(ingest),
        assets,
        db,
        staging_dir: cfg.staging_dir.clone(),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the committer for each asset kind, sharing one store when both
/// kinds name the same backend.
async fn build_asset_stores(cfg: &AppConfig) -> Result<AssetStores> {
    let thumbnail = build_asset_store(cfg, cfg.thumbnail_backend).await?;
    if cfg.video_backend == cfg.thumbnail_backend {
        return Ok(AssetStores::shared(thumbnail));
    }
    let video = build_asset_store(cfg, cfg.video_backend).await?;
    Ok(AssetStores { thumbnail, video })
}

/// Construct one committer backend.
async fn build_asset_store(
    cfg: &AppConfig,
    backend: StorageBackend,
) -> Result<Arc<dyn AssetStore>> {
    let store: Arc<dyn AssetStore> = match backend {
        StorageBackend::Local => {
            let store = LocalAssetStore::new(&cfg.assets_dir, cfg.public_base_url.clone())
                .await
                .with_context(|| format!("preparing assets directory {}", cfg.assets_dir))?;
            tracing::info!("Serving local assets from {}", store.root().display());
            Arc::new(store)
        }
        StorageBackend::S3 => {
            // validated in AppConfig
            let bucket = cfg.s3_bucket.clone().context("S3 bucket not configured")?;
            let region = cfg.s3_region.clone().context("S3 region not configured")?;
            Arc::new(
                RemoteAssetStore::s3(bucket, region, cfg.s3_endpoint.clone())
                    .context("building S3 client")?,
            )
        }
        StorageBackend::Inline => Arc::new(InlineAssetStore),
    };
    Ok(store)
}
