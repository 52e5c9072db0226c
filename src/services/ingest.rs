//! Upload ingestion: authorize, validate, stage, classify, commit, record.
//!
//! `IngestService::authorize` covers everything up to and including the
//! ownership check; `IngestService::ingest` takes the extracted upload part
//! from there to the updated record. The multipart field is pulled out by the
//! HTTP layer in between so that unauthenticated callers never have their
//! body read.
//!
//! Record reads and writes are not transactional: two uploads racing on the
//! same video both commit their asset and the later update wins.

use crate::{
    models::video::Video,
    services::{
        asset_store::{AssetStore, StorageError},
        auth::{AuthError, Authenticator},
        classifier::{Classification, MediaClassifier},
        keys::{self, KeyError},
        record_store::{RecordStore, RecordStoreError},
        stager::{AssetStager, MAX_THUMBNAIL_BYTES, MAX_VIDEO_BYTES, StageError},
    },
};
use axum::http::StatusCode;
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Which reference field an upload fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Thumbnail,
    Video,
}

impl AssetKind {
    /// Multipart field carrying the file.
    pub fn field_name(self) -> &'static str {
        match self {
            AssetKind::Thumbnail => "thumbnail",
            AssetKind::Video => "video",
        }
    }

    pub fn max_bytes(self) -> u64 {
        match self {
            AssetKind::Thumbnail => MAX_THUMBNAIL_BYTES,
            AssetKind::Video => MAX_VIDEO_BYTES,
        }
    }

    pub fn allowed_types(self) -> &'static [&'static str] {
        match self {
            AssetKind::Thumbnail => &["image/jpeg", "image/png"],
            AssetKind::Video => &["video/mp4"],
        }
    }
}

/// The committer behind each asset kind. Both fields may point at the same
/// store.
#[derive(Clone)]
pub struct AssetStores {
    pub thumbnail: Arc<dyn AssetStore>,
    pub video: Arc<dyn AssetStore>,
}

impl AssetStores {
    /// One store for both kinds.
    pub fn shared(store: Arc<dyn AssetStore>) -> Self {
        Self {
            thumbnail: store.clone(),
            video: store,
        }
    }

    pub fn for_kind(&self, kind: AssetKind) -> &Arc<dyn AssetStore> {
        match kind {
            AssetKind::Thumbnail => &self.thumbnail,
            AssetKind::Video => &self.video,
        }
    }
}

/// Where a request was when it was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Authenticating,
    Validating,
    Staging,
    Classifying,
    Committing,
    Updating,
    Done,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid video id")]
    InvalidIdentifier,
    #[error("couldn't validate bearer token")]
    Unauthorized(#[source] AuthError),
    #[error("video not found")]
    NotFound,
    #[error("not the owner of this video")]
    Forbidden,
    #[error("{0}")]
    BadRequest(String),
    #[error("unsupported media type `{0}`")]
    UnsupportedMediaType(String),
    #[error("upload exceeds the {0} byte limit")]
    PayloadTooLarge(u64),
    #[error("failed to stage upload")]
    Io(#[source] io::Error),
    #[error("failed to generate storage key")]
    RandomSource(#[source] KeyError),
    #[error("failed to store asset")]
    StorageUnavailable(#[source] StorageError),
    #[error("failed to read video record")]
    RecordLookup(#[source] RecordStoreError),
    #[error("failed to update video record")]
    UpdateFailed(#[source] RecordStoreError),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::InvalidIdentifier
            | IngestError::BadRequest(_)
            | IngestError::UnsupportedMediaType(_) => StatusCode::BAD_REQUEST,
            // Ownership failures deliberately share 401 with bad tokens.
            IngestError::Unauthorized(_) | IngestError::Forbidden => StatusCode::UNAUTHORIZED,
            IngestError::NotFound => StatusCode::NOT_FOUND,
            IngestError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            IngestError::Io(_)
            | IngestError::RandomSource(_)
            | IngestError::StorageUnavailable(_)
            | IngestError::RecordLookup(_)
            | IngestError::UpdateFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

impl From<StageError> for IngestError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::PayloadTooLarge { limit } => IngestError::PayloadTooLarge(limit),
            StageError::Io(err) => IngestError::Io(err),
        }
    }
}

/// Strip parameters and case from a declared content type.
pub fn normalize_media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Check a declared content type against the kind's allow-list and return
/// the normalized media type.
pub fn validate_content_type(
    kind: AssetKind,
    content_type: Option<&str>,
) -> Result<&'static str, IngestError> {
    let declared = content_type.unwrap_or_default();
    let normalized = normalize_media_type(declared);
    kind.allowed_types()
        .iter()
        .copied()
        .find(|allowed| *allowed == normalized)
        .ok_or_else(|| IngestError::UnsupportedMediaType(declared.to_string()))
}

pub struct IngestService {
    auth: Arc<dyn Authenticator>,
    records: Arc<dyn RecordStore>,
    assets: AssetStores,
    classifier: MediaClassifier,
    stager: AssetStager,
    key_bytes: usize,
}

impl IngestService {
    pub fn new(
        auth: Arc<dyn Authenticator>,
        records: Arc<dyn RecordStore>,
        assets: AssetStores,
        classifier: MediaClassifier,
        stager: AssetStager,
    ) -> Self {
        Self {
            auth,
            records,
            assets,
            classifier,
            stager,
            key_bytes: keys::DEFAULT_KEY_BYTES,
        }
    }

    /// Resolve the target video and make sure the caller owns it.
    pub async fn authorize(
        &self,
        raw_video_id: &str,
        token: Result<&str, AuthError>,
    ) -> Result<Video, IngestError> {
        let video_id = Uuid::parse_str(raw_video_id).map_err(|_| {
            reject(IngestStage::Authenticating, IngestError::InvalidIdentifier)
        })?;

        let user_id = match token {
            Ok(token) => self.auth.authenticate(token).await,
            Err(err) => Err(err),
        }
        .map_err(|err| reject(IngestStage::Authenticating, IngestError::Unauthorized(err)))?;

        let video = self
            .records
            .get(video_id)
            .await
            .map_err(|err| reject(IngestStage::Authenticating, IngestError::RecordLookup(err)))?
            .ok_or_else(|| reject(IngestStage::Authenticating, IngestError::NotFound))?;

        if video.user_id != user_id {
            return Err(reject(IngestStage::Authenticating, IngestError::Forbidden));
        }

        info!(%video_id, %user_id, "authorized upload");
        Ok(video)
    }

    /// Store the uploaded part and point the record at it.
    ///
    /// The staged temp file lives for the duration of this call only.
    pub async fn ingest<S, E>(
        &self,
        mut video: Video,
        kind: AssetKind,
        content_type: Option<&str>,
        body: S,
    ) -> Result<Video, IngestError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<io::Error>,
    {
        let media_type = validate_content_type(kind, content_type)
            .map_err(|err| reject(IngestStage::Validating, err))?;

        let mut staged = self
            .stager
            .stage(body, media_type, kind.max_bytes())
            .await
            .map_err(|err| {
                let err = match err {
                    // the transport hit its own body limit mid-stream
                    StageError::Io(e) if e.kind() == io::ErrorKind::FileTooLarge => {
                        IngestError::PayloadTooLarge(kind.max_bytes())
                    }
                    other => other.into(),
                };
                reject(IngestStage::Staging, err)
            })?;

        let prefix = match kind {
            AssetKind::Video => Some(self.classify(staged.path()).await),
            AssetKind::Thumbnail => None,
        };

        let key = keys::generate_key(
            self.key_bytes,
            keys::extension_for(media_type),
            prefix.map(Classification::as_str),
        )
        .map_err(|err| reject(IngestStage::Committing, IngestError::RandomSource(err)))?;

        let store = self.assets.for_kind(kind);
        let locator = store
            .commit(&mut staged, &key, media_type)
            .await
            .map_err(|err| reject(IngestStage::Committing, IngestError::StorageUnavailable(err)))?;

        match kind {
            AssetKind::Thumbnail => video.thumbnail_url = Some(locator.into_string()),
            AssetKind::Video => video.video_url = Some(locator.into_string()),
        }
        video.updated_at = Utc::now();

        if let Err(err) = self.records.update(&video).await {
            if let Err(cleanup_err) = store.discard(&key).await {
                warn!(
                    error = %cleanup_err,
                    key = %key,
                    "failed to discard asset after record update failure"
                );
            }
            return Err(reject(IngestStage::Updating, IngestError::UpdateFailed(err)));
        }

        info!(
            video_id = %video.id,
            kind = kind.field_name(),
            key = %key,
            size_bytes = staged.len(),
            content_type = staged.content_type(),
            backend = %store.backend(),
            stage = ?IngestStage::Done,
            "upload ingested"
        );
        Ok(video)
    }

    /// Orientation label for a staged video; unclassifiable files fall back to `other`.
    async fn classify(&self, path: &std::path::Path) -> Classification {
        match self.classifier.classify(path).await {
            Ok(label) => label,
            Err(err) => {
                warn!(
                    error = %err,
                    stage = ?IngestStage::Classifying,
                    "classification unavailable, using `other`"
                );
                Classification::Other
            }
        }
    }
}

/// Log a rejection with the stage it happened in.
fn reject(stage: IngestStage, err: IngestError) -> IngestError {
    if err.is_client_error() {
        info!(?stage, error = %err, "upload rejected");
    } else {
        tracing::error!(?stage, error = ?err, "upload failed");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        asset_store::{
            AssetLocator, AssetReader, InlineAssetStore, LocalAssetStore, StorageBackend,
            StorageResult,
        },
        auth::tests::{SECRET, sign},
        auth::JwtAuthenticator,
        classifier::tests::FixedProber,
        keys::StorageKey,
        record_store::{SqliteRecordStore, tests::memory_store},
        stager::StagedAsset,
    };
    use async_trait::async_trait;
    use futures::stream;
    use std::path::Path;
    use tempfile::TempDir;

    struct Harness {
        service: IngestService,
        records: SqliteRecordStore,
        staging: TempDir,
        assets: TempDir,
        owner: Uuid,
        video: Video,
    }

    impl Harness {
        async fn new(probe: Option<(f64, f64)>) -> Self {
            let staging = tempfile::tempdir().unwrap();
            let assets = tempfile::tempdir().unwrap();
            let store = LocalAssetStore::new(assets.path(), "http://localhost:8091")
                .await
                .unwrap();
            Self::with_store(probe, staging, assets, Arc::new(store)).await
        }

        async fn with_store(
            probe: Option<(f64, f64)>,
            staging: TempDir,
            assets: TempDir,
            store: Arc<dyn AssetStore>,
        ) -> Self {
            let records = memory_store().await;
            let owner = Uuid::new_v4();
            let video = Video::new(owner, "title", "description");
            records.insert(&video).await.unwrap();

            let service = IngestService::new(
                Arc::new(JwtAuthenticator::new(SECRET)),
                Arc::new(records.clone()),
                AssetStores::shared(store),
                MediaClassifier::new(Arc::new(FixedProber(probe))),
                AssetStager::new(staging.path()),
            );
            Self {
                service,
                records,
                staging,
                assets,
                owner,
                video,
            }
        }

        fn token(&self, user: Uuid) -> String {
            sign(user, SECRET, chrono::Duration::hours(1))
        }

        fn staging_is_empty(&self) -> bool {
            std::fs::read_dir(self.staging.path()).unwrap().next().is_none()
        }

        fn stored_files(&self) -> Vec<std::path::PathBuf> {
            fn walk(dir: &Path, out: &mut Vec<std::path::PathBuf>) {
                for entry in std::fs::read_dir(dir).unwrap() {
                    let path = entry.unwrap().path();
                    if path.is_dir() {
                        walk(&path, out);
                    } else {
                        out.push(path);
                    }
                }
            }
            let mut out = Vec::new();
            walk(self.assets.path(), &mut out);
            out
        }
    }

    fn body(bytes: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(vec![Ok(Bytes::from(bytes))])
    }

    #[test]
    fn content_type_allow_lists() {
        for ok in ["image/png", "image/jpeg", "IMAGE/PNG", "image/jpeg; q=1"] {
            assert!(validate_content_type(AssetKind::Thumbnail, Some(ok)).is_ok(), "{ok}");
        }
        assert_eq!(
            validate_content_type(AssetKind::Video, Some("video/mp4")).unwrap(),
            "video/mp4"
        );
        for bad in [Some("image/gif"), Some("video/mp4"), Some(""), None] {
            assert!(matches!(
                validate_content_type(AssetKind::Thumbnail, bad),
                Err(IngestError::UnsupportedMediaType(_))
            ));
        }
        assert!(validate_content_type(AssetKind::Video, Some("video/avi")).is_err());
        assert!(validate_content_type(AssetKind::Video, Some("image/png")).is_err());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(IngestError::InvalidIdentifier.status(), StatusCode::BAD_REQUEST);
        assert_eq!(IngestError::Forbidden.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            IngestError::Unauthorized(AuthError::MissingToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(IngestError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            IngestError::PayloadTooLarge(1).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            IngestError::UpdateFailed(RecordStoreError::NotFound(Uuid::nil())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn authorize_checks_id_token_and_owner() {
        let h = Harness::new(None).await;
        let owner_token = h.token(h.owner);
        let id = h.video.id.to_string();

        assert!(matches!(
            h.service.authorize("not-a-uuid", Ok(&owner_token)).await,
            Err(IngestError::InvalidIdentifier)
        ));
        assert!(matches!(
            h.service.authorize(&id, Err(AuthError::MissingToken)).await,
            Err(IngestError::Unauthorized(_))
        ));
        assert!(matches!(
            h.service.authorize(&id, Ok("garbage")).await,
            Err(IngestError::Unauthorized(_))
        ));
        assert!(matches!(
            h.service
                .authorize(&Uuid::new_v4().to_string(), Ok(&owner_token))
                .await,
            Err(IngestError::NotFound)
        ));

        let stranger = h.token(Uuid::new_v4());
        assert!(matches!(
            h.service.authorize(&id, Ok(&stranger)).await,
            Err(IngestError::Forbidden)
        ));
        assert_eq!(h.records.get(h.video.id).await.unwrap().unwrap(), h.video);
        assert!(h.stored_files().is_empty());

        let video = h.service.authorize(&id, Ok(&owner_token)).await.unwrap();
        assert_eq!(video.id, h.video.id);
    }

    #[tokio::test]
    async fn thumbnail_upload_updates_record() {
        let h = Harness::new(None).await;
        let png = vec![7u8; 2 << 20];

        let updated = h
            .service
            .ingest(h.video.clone(), AssetKind::Thumbnail, Some("image/png"), body(png.clone()))
            .await
            .unwrap();

        let url = updated.thumbnail_url.clone().unwrap();
        assert!(url.starts_with("http://localhost:8091/assets/"));
        assert!(url.ends_with(".png"));
        assert!(updated.updated_at >= h.video.updated_at);
        assert_eq!(h.records.get(h.video.id).await.unwrap().unwrap().thumbnail_url, Some(url));

        let files = h.stored_files();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), png);
        assert!(h.staging_is_empty());
    }

    #[tokio::test]
    async fn video_key_is_prefixed_by_orientation() {
        for (probe, prefix) in [
            (Some((1920.0, 1080.0)), "landscape/"),
            (Some((1080.0, 1920.0)), "portrait/"),
            (Some((640.0, 480.0)), "other/"),
            (None, "other/"),
        ] {
            let h = Harness::new(probe).await;
            let updated = h
                .service
                .ingest(h.video.clone(), AssetKind::Video, Some("video/mp4"), body(b"mp4".to_vec()))
                .await
                .unwrap();
            let url = updated.video_url.unwrap();
            let expected = format!("http://localhost:8091/assets/{prefix}");
            assert!(url.starts_with(&expected), "{url} should start with {expected}");
            assert!(url.ends_with(".mp4"));
            assert!(h.staging_is_empty());
        }
    }

    #[tokio::test]
    async fn unsupported_type_leaves_everything_untouched() {
        let h = Harness::new(Some((1920.0, 1080.0))).await;
        let result = h
            .service
            .ingest(h.video.clone(), AssetKind::Video, Some("video/avi"), body(b"avi".to_vec()))
            .await;

        assert!(matches!(result, Err(IngestError::UnsupportedMediaType(_))));
        assert_eq!(h.records.get(h.video.id).await.unwrap().unwrap(), h.video);
        assert!(h.stored_files().is_empty());
        assert!(h.staging_is_empty());
    }

    #[tokio::test]
    async fn oversized_thumbnail_is_rejected() {
        let h = Harness::new(None).await;
        let too_big = vec![0u8; (MAX_THUMBNAIL_BYTES + 1) as usize];
        let result = h
            .service
            .ingest(h.video.clone(), AssetKind::Thumbnail, Some("image/jpeg"), body(too_big))
            .await;

        assert!(matches!(result, Err(IngestError::PayloadTooLarge(_))));
        assert_eq!(h.records.get(h.video.id).await.unwrap().unwrap(), h.video);
        assert!(h.staging_is_empty());
    }

    #[tokio::test]
    async fn each_kind_commits_to_its_own_store() {
        let staging = tempfile::tempdir().unwrap();
        let assets = tempfile::tempdir().unwrap();
        let local = LocalAssetStore::new(assets.path(), "http://localhost:8091")
            .await
            .unwrap();
        let mut h = Harness::with_store(
            Some((1920.0, 1080.0)),
            staging,
            assets,
            Arc::new(local),
        )
        .await;
        h.service.assets.thumbnail = Arc::new(InlineAssetStore);

        let updated = h
            .service
            .ingest(h.video.clone(), AssetKind::Thumbnail, Some("image/png"), body(b"hi".to_vec()))
            .await
            .unwrap();
        assert_eq!(updated.thumbnail_url.as_deref(), Some("data:image/png;base64,aGk="));
        assert!(h.stored_files().is_empty());

        let updated = h
            .service
            .ingest(updated, AssetKind::Video, Some("video/mp4"), body(b"mp4".to_vec()))
            .await
            .unwrap();
        let url = updated.video_url.unwrap();
        assert!(url.starts_with("http://localhost:8091/assets/landscape/"));
        assert_eq!(h.stored_files().len(), 1);
        assert_eq!(
            updated.thumbnail_url.as_deref(),
            Some("data:image/png;base64,aGk=")
        );
    }

    struct BrokenStore;

    #[async_trait]
    impl AssetStore for BrokenStore {
        fn backend(&self) -> StorageBackend {
            StorageBackend::S3
        }

        async fn commit(
            &self,
            _asset: &mut StagedAsset,
            _key: &StorageKey,
            _content_type: &str,
        ) -> StorageResult<AssetLocator> {
            Err(StorageError::Backend("bucket unreachable".into()))
        }

        async fn open(&self, key: &StorageKey) -> StorageResult<AssetReader> {
            Err(StorageError::NotFound(key.to_string()))
        }

        async fn discard(&self, _key: &StorageKey) -> StorageResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn transport_body_limit_is_payload_too_large() {
        let h = Harness::new(None).await;
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::FileTooLarge, "length limit exceeded")),
        ]);
        let result = h
            .service
            .ingest(h.video.clone(), AssetKind::Thumbnail, Some("image/png"), body)
            .await;

        assert!(matches!(
            result,
            Err(IngestError::PayloadTooLarge(MAX_THUMBNAIL_BYTES))
        ));
        assert!(h.staging_is_empty());
    }

    #[tokio::test]
    async fn storage_failure_keeps_record_and_cleans_staging() {
        let h = Harness::with_store(
            Some((1920.0, 1080.0)),
            tempfile::tempdir().unwrap(),
            tempfile::tempdir().unwrap(),
            Arc::new(BrokenStore),
        )
        .await;

        let result = h
            .service
            .ingest(h.video.clone(), AssetKind::Video, Some("video/mp4"), body(b"mp4".to_vec()))
            .await;

        assert!(matches!(result, Err(IngestError::StorageUnavailable(_))));
        assert_eq!(h.records.get(h.video.id).await.unwrap().unwrap(), h.video);
        assert!(h.staging_is_empty());
    }

    #[tokio::test]
    async fn failed_record_update_discards_committed_asset() {
        let h = Harness::new(None).await;
        let mut missing = h.video.clone();
        missing.id = Uuid::new_v4();

        let result = h
            .service
            .ingest(missing, AssetKind::Thumbnail, Some("image/png"), body(b"png".to_vec()))
            .await;

        assert!(matches!(result, Err(IngestError::UpdateFailed(_))));
        assert!(h.stored_files().is_empty());
        assert!(h.staging_is_empty());
    }
}
