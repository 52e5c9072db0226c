//! Final homes for staged uploads.
//!
//! Every backend implements `AssetStore`; the ingest pipeline only ever talks
//! to the trait, and configuration decides which backend sits behind it.
//!
//! - `LocalAssetStore`  → `<root>/<key>`, served back under `/assets/<key>`
//! - `RemoteAssetStore` → an object in an S3-compatible bucket
//! - `InlineAssetStore` → a self-contained `data:` URL, nothing stored

use crate::services::{
    keys::StorageKey,
    stager::{MAX_THUMBNAIL_BYTES, StagedAsset},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, ObjectStoreExt,
    PutMultipartOptions, WriteMultipart, path::Path as ObjectPath,
};
use std::{
    fmt, io,
    path::{Path, PathBuf},
    pin::Pin,
    str::FromStr,
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};
use uuid::Uuid;

const MAX_KEY_LEN: usize = 1024;
const READ_BUF_BYTES: usize = 1 << 20;
const UPLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    #[error("asset `{0}` not found")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    S3,
    Inline,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "inline" => Ok(Self::Inline),
            other => Err(format!(
                "unknown storage backend `{other}` (expected local, s3 or inline)"
            )),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Inline => "inline",
        })
    }
}

/// Resolvable reference to a committed asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLocator(String);

impl AssetLocator {
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AssetLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte stream of a stored asset.
pub type AssetReader = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[async_trait]
pub trait AssetStore: Send + Sync {
    fn backend(&self) -> StorageBackend;

    /// Persist the staged bytes under `key` and return where they now live.
    async fn commit(
        &self,
        asset: &mut StagedAsset,
        key: &StorageKey,
        content_type: &str,
    ) -> StorageResult<AssetLocator>;

    /// Stream a previously committed asset.
    async fn open(&self, key: &StorageKey) -> StorageResult<AssetReader>;

    /// Remove a committed asset. Missing assets are not an error.
    async fn discard(&self, key: &StorageKey) -> StorageResult<()>;
}

/// Reject keys that could escape the store root.
fn ensure_key_safe(key: &StorageKey) -> StorageResult<()> {
    let raw = key.as_str();
    if raw.is_empty()
        || raw.len() > MAX_KEY_LEN
        || raw.starts_with('/')
        || raw.contains("..")
        || raw
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StorageError::InvalidKey(raw.to_string()));
    }
    Ok(())
}

/// Assets as plain files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalAssetStore {
    root: PathBuf,
    base_url: String,
}

impl LocalAssetStore {
    /// `base_url` is the public origin, e.g. `http://localhost:8091`.
    pub async fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &StorageKey) -> StorageResult<PathBuf> {
        ensure_key_safe(key)?;
        Ok(self.root.join(key.as_str()))
    }

    fn locator(&self, key: &StorageKey) -> AssetLocator {
        AssetLocator(format!("{}/assets/{}", self.base_url, key))
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn commit(
        &self,
        asset: &mut StagedAsset,
        key: &StorageKey,
        _content_type: &str,
    ) -> StorageResult<AssetLocator> {
        let start = Instant::now();
        let path = self.key_path(key)?;
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::InvalidKey(key.to_string())
        })?;
        fs::create_dir_all(&parent).await?;

        // Write beside the target, then rename, so readers never see a partial file.
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let copied = match copy_into(asset, &tmp_path).await {
            Ok(copied) => copied,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };
        if let Err(err) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        info!(
            path = %path.display(),
            key = %key,
            size_bytes = copied,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "local asset committed"
        );
        Ok(self.locator(key))
    }

    async fn open(&self, key: &StorageKey) -> StorageResult<AssetReader> {
        let path = self.key_path(key)?;
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn discard(&self, key: &StorageKey) -> StorageResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => debug!("removed asset {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("asset {} already missing", path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        Ok(())
    }
}

async fn copy_into(asset: &mut StagedAsset, dest: &Path) -> io::Result<u64> {
    let mut out = File::create(dest).await?;
    let copied = tokio::io::copy(asset.reader().await?, &mut out).await?;
    out.flush().await?;
    out.sync_all().await?;
    Ok(copied)
}

/// Assets as objects in an S3-compatible bucket.
#[derive(Clone)]
pub struct RemoteAssetStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    region: String,
    endpoint: Option<String>,
}

impl RemoteAssetStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            region: region.into(),
            endpoint,
        }
    }

    /// Build an S3 client from the environment plus explicit bucket/region.
    pub fn s3(bucket: String, region: String, endpoint: Option<String>) -> StorageResult<Self> {
        let mut builder = object_store::aws::AmazonS3Builder::from_env()
            .with_region(region.clone())
            .with_bucket_name(bucket.clone());
        if let Some(endpoint) = &endpoint {
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(Self::new(Arc::new(store), bucket, region, endpoint))
    }

    fn locator(&self, key: &StorageKey) -> AssetLocator {
        match &self.endpoint {
            Some(endpoint) => AssetLocator(format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.bucket,
                key
            )),
            None => AssetLocator(format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            )),
        }
    }

    async fn upload(
        &self,
        asset: &mut StagedAsset,
        location: &ObjectPath,
        content_type: &str,
    ) -> StorageResult<u64> {
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );
        let opts = PutMultipartOptions {
            attributes,
            ..Default::default()
        };
        let upload = self
            .store
            .put_multipart_opts(location, opts)
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        let mut writer = WriteMultipart::new(upload);

        let reader = match asset.reader().await {
            Ok(reader) => reader,
            Err(err) => {
                let _ = writer.abort().await;
                return Err(StorageError::Io(err));
            }
        };
        let mut buf = vec![0u8; READ_BUF_BYTES];
        let mut sent: u64 = 0;
        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    let _ = writer.abort().await;
                    return Err(StorageError::Io(err));
                }
            };
            if let Err(err) = writer.wait_for_capacity(UPLOAD_CONCURRENCY).await {
                let _ = writer.abort().await;
                return Err(StorageError::Backend(err.to_string()));
            }
            writer.write(&buf[..read]);
            sent += read as u64;
        }

        writer
            .finish()
            .await
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        Ok(sent)
    }
}

#[async_trait]
impl AssetStore for RemoteAssetStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::S3
    }

    async fn commit(
        &self,
        asset: &mut StagedAsset,
        key: &StorageKey,
        content_type: &str,
    ) -> StorageResult<AssetLocator> {
        ensure_key_safe(key)?;
        let start = Instant::now();
        let location = ObjectPath::from(key.as_str());

        match self.upload(asset, &location, content_type).await {
            Ok(size) => {
                info!(
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "object committed"
                );
                Ok(self.locator(key))
            }
            Err(err) => {
                error!(
                    error = %err,
                    bucket = %self.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "object upload failed"
                );
                Err(err)
            }
        }
    }

    async fn open(&self, key: &StorageKey) -> StorageResult<AssetReader> {
        ensure_key_safe(key)?;
        let location = ObjectPath::from(key.as_str());
        let result = self
            .store
            .get_opts(&location, GetOptions::default())
            .await
            .map_err(|err| match err {
                object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
                other => StorageError::Backend(other.to_string()),
            })?;
        Ok(Box::pin(result.into_stream().map_err(io::Error::other)))
    }

    async fn discard(&self, key: &StorageKey) -> StorageResult<()> {
        ensure_key_safe(key)?;
        let location = ObjectPath::from(key.as_str());
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(StorageError::Backend(err.to_string())),
        }
    }
}

/// Largest asset that may be encoded into a locator.
pub const INLINE_MAX_BYTES: u64 = MAX_THUMBNAIL_BYTES;

/// Encodes the asset into the locator itself. Only suitable for small assets;
/// anything over `INLINE_MAX_BYTES` is refused.
#[derive(Debug, Clone, Default)]
pub struct InlineAssetStore;

#[async_trait]
impl AssetStore for InlineAssetStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Inline
    }

    async fn commit(
        &self,
        asset: &mut StagedAsset,
        _key: &StorageKey,
        content_type: &str,
    ) -> StorageResult<AssetLocator> {
        if asset.len() > INLINE_MAX_BYTES {
            return Err(StorageError::Backend(format!(
                "{} byte asset exceeds the {} byte inline limit",
                asset.len(),
                INLINE_MAX_BYTES
            )));
        }
        let mut bytes = Vec::with_capacity(asset.len() as usize);
        asset.reader().await?.read_to_end(&mut bytes).await?;
        Ok(AssetLocator(format!(
            "data:{};base64,{}",
            content_type,
            STANDARD.encode(&bytes)
        )))
    }

    async fn open(&self, key: &StorageKey) -> StorageResult<AssetReader> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn discard(&self, _key: &StorageKey) -> StorageResult<()> {
        Ok(())
    }
}
