use crate::services::{asset_store::StorageBackend, classifier::DEFAULT_PROBE_TIMEOUT};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Root directory for the local backend.
    pub assets_dir: String,
    /// Where in-flight uploads are buffered.
    pub staging_dir: PathBuf,
    /// Public origin used to build local asset URLs.
    pub public_base_url: String,
    pub thumbnail_backend: StorageBackend,
    pub video_backend: StorageBackend,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub jwt_secret: String,
    pub ffprobe_path: String,
    pub probe_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media upload ingestion service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides MEDIA_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory for locally stored assets (overrides MEDIA_INGEST_ASSETS_DIR)
    #[arg(long)]
    pub assets_dir: Option<String>,

    /// Directory for staged uploads (overrides MEDIA_INGEST_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Public base URL for local assets (overrides MEDIA_INGEST_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Default storage backend: local, s3 or inline (overrides MEDIA_INGEST_STORAGE_BACKEND)
    #[arg(long)]
    pub storage_backend: Option<StorageBackend>,

    /// Backend for thumbnails (overrides MEDIA_INGEST_THUMBNAIL_BACKEND)
    #[arg(long)]
    pub thumbnail_backend: Option<StorageBackend>,

    /// Backend for videos: local or s3 (overrides MEDIA_INGEST_VIDEO_BACKEND)
    #[arg(long)]
    pub video_backend: Option<StorageBackend>,

    /// S3 bucket (overrides MEDIA_INGEST_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// S3 region (overrides MEDIA_INGEST_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Custom S3-compatible endpoint (overrides MEDIA_INGEST_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Path to the ffprobe binary (overrides MEDIA_INGEST_FFPROBE)
    #[arg(long)]
    pub ffprobe_path: Option<String>,

    /// Seconds before a probe is abandoned (overrides MEDIA_INGEST_PROBE_TIMEOUT_SECS)
    #[arg(long)]
    pub probe_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("MEDIA_INGEST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("MEDIA_INGEST_PORT")?.unwrap_or(8091);
        let env_db = env::var("MEDIA_INGEST_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/media_ingest.db".into());
        let env_assets =
            env::var("MEDIA_INGEST_ASSETS_DIR").unwrap_or_else(|_| "./data/assets".into());
        let env_staging = env::var("MEDIA_INGEST_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir());
        let default_backend = match args.storage_backend {
            Some(backend) => backend,
            None => env_parse::<StorageBackend>("MEDIA_INGEST_STORAGE_BACKEND")?
                .unwrap_or(StorageBackend::Local),
        };
        let env_thumbnail_backend = env_parse::<StorageBackend>("MEDIA_INGEST_THUMBNAIL_BACKEND")?;
        let env_video_backend = env_parse::<StorageBackend>("MEDIA_INGEST_VIDEO_BACKEND")?;
        let env_timeout = env_parse::<u64>("MEDIA_INGEST_PROBE_TIMEOUT_SECS")?;

        // --- Merge ---
        let port = args.port.unwrap_or(env_port);
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            database_url: args.database_url.unwrap_or(env_db),
            assets_dir: args.assets_dir.unwrap_or(env_assets),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            public_base_url: args
                .public_base_url
                .or_else(|| env::var("MEDIA_INGEST_PUBLIC_BASE_URL").ok())
                .unwrap_or_else(|| format!("http://localhost:{}", port)),
            thumbnail_backend: args
                .thumbnail_backend
                .or(env_thumbnail_backend)
                .unwrap_or(default_backend),
            video_backend: args
                .video_backend
                .or(env_video_backend)
                .unwrap_or(default_backend),
            s3_bucket: args.s3_bucket.or_else(|| env::var("MEDIA_INGEST_S3_BUCKET").ok()),
            s3_region: args
                .s3_region
                .or_else(|| env::var("MEDIA_INGEST_S3_REGION").ok())
                .or_else(|| env::var("AWS_REGION").ok()),
            s3_endpoint: args
                .s3_endpoint
                .or_else(|| env::var("MEDIA_INGEST_S3_ENDPOINT").ok()),
            jwt_secret: env::var("MEDIA_INGEST_JWT_SECRET")
                .context("MEDIA_INGEST_JWT_SECRET must be set")?,
            ffprobe_path: args
                .ffprobe_path
                .or_else(|| env::var("MEDIA_INGEST_FFPROBE").ok())
                .unwrap_or_else(|| "ffprobe".into()),
            probe_timeout: args
                .probe_timeout_secs
                .or(env_timeout)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.video_backend == StorageBackend::Inline {
            bail!("videos cannot use the inline backend; pick local or s3");
        }
        if self.uses(StorageBackend::S3) && (self.s3_bucket.is_none() || self.s3_region.is_none())
        {
            bail!("the s3 storage backend needs both an S3 bucket and region");
        }
        if self.jwt_secret.is_empty() {
            bail!("MEDIA_INGEST_JWT_SECRET must not be empty");
        }
        Ok(())
    }

    pub fn uses(&self, backend: StorageBackend) -> bool {
        self.thumbnail_backend == backend || self.video_backend == backend
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an optional environment variable.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", name, value, err)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
