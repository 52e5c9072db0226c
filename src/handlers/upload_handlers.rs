//! HTTP handlers for media uploads and asset downloads.
//! Upload bodies are streamed straight into the staging area; nothing is
//! buffered in memory beyond a single multipart chunk.

use crate::{
    errors::AppError,
    models::video::Video,
    services::{
        auth::bearer_token,
        ingest::{AssetKind, IngestError},
        keys::StorageKey,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Serialize;
use std::io;

/// Body of a successful video upload.
#[derive(Debug, Serialize)]
pub struct VideoUploadResponse {
    #[serde(rename = "videoURL")]
    pub video_url: String,
}

/// `POST /api/thumbnail/{videoID}` with the image in multipart field `thumbnail`.
pub async fn upload_thumbnail(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Video>, AppError> {
    let video = ingest_upload(&state, AssetKind::Thumbnail, &video_id, &headers, multipart).await?;
    Ok(Json(video))
}

/// `POST /api/video/{videoID}` with the MP4 in multipart field `video`.
pub async fn upload_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VideoUploadResponse>, AppError> {
    let video = ingest_upload(&state, AssetKind::Video, &video_id, &headers, multipart).await?;
    let video_url = video
        .video_url
        .ok_or_else(|| AppError::internal("video URL missing after upload"))?;
    Ok(Json(VideoUploadResponse { video_url }))
}

/// Authorize first, then walk the form until the expected field shows up and
/// hand its byte stream to the ingest service.
async fn ingest_upload(
    state: &AppState,
    kind: AssetKind,
    video_id: &str,
    headers: &HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Video, AppError> {
    let video = state
        .ingest
        .authorize(video_id, bearer_token(headers))
        .await?;

    let mut multipart = multipart.map_err(|err| {
        IngestError::BadRequest(format!("unable to parse form: {}", err.body_text()))
    })?;

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| form_error(kind, err))?
            .ok_or_else(|| {
                IngestError::BadRequest(format!("missing form field `{}`", kind.field_name()))
            })?;

        if field.name() != Some(kind.field_name()) {
            continue;
        }

        let content_type = field.content_type().map(str::to_owned);
        let body = field.map(|chunk| chunk.map_err(chunk_error));
        let video = state
            .ingest
            .ingest(video, kind, content_type.as_deref(), body)
            .await?;
        return Ok(video);
    }
}

/// A form that outgrows the route's body limit is a 413, anything else a 400.
fn form_error(kind: AssetKind, err: MultipartError) -> IngestError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        IngestError::PayloadTooLarge(kind.max_bytes())
    } else {
        IngestError::BadRequest(format!("unable to parse form: {}", err))
    }
}

/// Body-limit failures mid-field keep their meaning through the stager.
fn chunk_error(err: MultipartError) -> io::Error {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        io::Error::new(io::ErrorKind::FileTooLarge, err)
    } else {
        io::Error::other(err)
    }
}

/// `GET /assets/{*key}` streams a committed asset back.
pub async fn get_asset(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let key = StorageKey::from_raw(key);
    let content_type = content_type_for(&key);
    let reader = state
        .assets
        .for_kind(kind_for(content_type))
        .open(&key)
        .await?;

    let mut response = Response::new(Body::from_stream(reader));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok(response)
}

fn content_type_for(key: &StorageKey) -> &'static str {
    match key.extension().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("jpeg" | "jpg") => "image/jpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Which store a key was committed to, judged by its media type.
fn kind_for(content_type: &str) -> AssetKind {
    if content_type.starts_with("video/") {
        AssetKind::Video
    } else {
        AssetKind::Thumbnail
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        db,
        models::video::Video,
        routes::routes::routes,
        services::{
            asset_store::LocalAssetStore,
            auth::{
                JwtAuthenticator,
                tests::{SECRET, sign},
            },
            classifier::{MediaClassifier, tests::FixedProber},
            asset_store::AssetStore,
            ingest::{AssetStores, IngestService},
            stager::MAX_THUMBNAIL_BYTES,
            record_store::{RecordStore, SqliteRecordStore},
            stager::AssetStager,
        },
        state::AppState,
    };
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use uuid::Uuid;

    const BOUNDARY: &str = "XBOUNDARYX";

    struct TestApp {
        router: Router,
        records: SqliteRecordStore,
        staging: TempDir,
        assets: TempDir,
        video: Video,
    }

    impl TestApp {
        async fn new() -> Self {
            let pool = Arc::new(db::memory_pool().await.unwrap());
            let records = SqliteRecordStore::new(pool.clone());
            let video = Video::new(Uuid::new_v4(), "title", "description");
            records.insert(&video).await.unwrap();

            let staging = tempfile::tempdir().unwrap();
            let assets = tempfile::tempdir().unwrap();
            let store: Arc<dyn AssetStore> = Arc::new(
                LocalAssetStore::new(assets.path(), "http://localhost:8091")
                    .await
                    .unwrap(),
            );
            let stores = AssetStores::shared(store);
            let ingest = IngestService::new(
                Arc::new(JwtAuthenticator::new(SECRET)),
                Arc::new(records.clone()),
                stores.clone(),
                MediaClassifier::new(Arc::new(FixedProber(Some((1920.0, 1080.0))))),
                AssetStager::new(staging.path()),
            );
            let state = AppState {
                ingest: Arc::new(ingest),
                assets: stores,
                db: pool,
                staging_dir: staging.path().to_path_buf(),
            };

            Self {
                router: routes().with_state(state),
                records,
                staging,
                assets,
                video,
            }
        }

        fn owner_token(&self) -> String {
            sign(self.video.user_id, SECRET, chrono::Duration::hours(1))
        }

        fn is_empty(dir: &TempDir) -> bool {
            std::fs::read_dir(dir.path()).unwrap().next().is_none()
        }
    }

    fn multipart_body(field: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(uri: &str, token: Option<&str>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri).header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn thumbnail_upload_round_trip() {
        let app = TestApp::new().await;
        let png = vec![0x89u8; 2 << 20];
        let uri = format!("/api/thumbnail/{}", app.video.id);

        let response = app
            .router
            .clone()
            .oneshot(upload_request(
                &uri,
                Some(&app.owner_token()),
                multipart_body("thumbnail", "image/png", &png),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        let url = json["thumbnail_url"].as_str().unwrap().to_string();
        assert_eq!(json["id"], app.video.id.to_string());
        assert!(url.ends_with(".png"));

        let stored = app.records.get(app.video.id).await.unwrap().unwrap();
        assert_eq!(stored.thumbnail_url.as_deref(), Some(url.as_str()));
        assert!(TestApp::is_empty(&app.staging));

        let path = url.strip_prefix("http://localhost:8091").unwrap();
        let response = app
            .router
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.as_ref(), png.as_slice());
    }

    #[tokio::test]
    async fn video_upload_returns_locator() {
        let app = TestApp::new().await;
        let uri = format!("/api/video/{}", app.video.id);

        let response = app
            .router
            .clone()
            .oneshot(upload_request(
                &uri,
                Some(&app.owner_token()),
                multipart_body("video", "video/mp4", b"not really an mp4"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        let url = json["videoURL"].as_str().unwrap();
        assert!(url.starts_with("http://localhost:8091/assets/landscape/"));
        let stored = app.records.get(app.video.id).await.unwrap().unwrap();
        assert_eq!(stored.video_url.as_deref(), Some(url));
    }

    #[tokio::test]
    async fn avi_upload_is_rejected_without_side_effects() {
        let app = TestApp::new().await;
        let uri = format!("/api/video/{}", app.video.id);

        let response = app
            .router
            .clone()
            .oneshot(upload_request(
                &uri,
                Some(&app.owner_token()),
                multipart_body("video", "video/avi", b"RIFF....AVI "),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(app.records.get(app.video.id).await.unwrap().unwrap(), app.video);
        assert!(TestApp::is_empty(&app.staging));
        assert!(TestApp::is_empty(&app.assets));
    }

    #[tokio::test]
    async fn other_users_token_is_unauthorized() {
        let app = TestApp::new().await;
        let uri = format!("/api/thumbnail/{}", app.video.id);
        let stranger = sign(Uuid::new_v4(), SECRET, chrono::Duration::hours(1));

        let response = app
            .router
            .clone()
            .oneshot(upload_request(
                &uri,
                Some(&stranger),
                multipart_body("thumbnail", "image/png", b"png"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["status"], 401);

        assert_eq!(app.records.get(app.video.id).await.unwrap().unwrap(), app.video);
        assert!(TestApp::is_empty(&app.assets));
    }

    #[tokio::test]
    async fn request_errors_map_to_statuses() {
        let app = TestApp::new().await;
        let token = app.owner_token();
        let body = || multipart_body("thumbnail", "image/png", b"png");

        let cases = [
            ("/api/thumbnail/not-a-uuid".to_string(), Some(token.as_str()), body(), StatusCode::BAD_REQUEST),
            (format!("/api/thumbnail/{}", app.video.id), None, body(), StatusCode::UNAUTHORIZED),
            (format!("/api/thumbnail/{}", Uuid::new_v4()), Some(token.as_str()), body(), StatusCode::NOT_FOUND),
            (
                format!("/api/thumbnail/{}", app.video.id),
                Some(token.as_str()),
                multipart_body("avatar", "image/png", b"png"),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (uri, token, body, expected) in cases {
            let response = app
                .router
                .clone()
                .oneshot(upload_request(&uri, token, body))
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "{uri}");
        }
        assert!(TestApp::is_empty(&app.assets));
        assert!(TestApp::is_empty(&app.staging));
    }

    #[tokio::test]
    async fn form_over_body_limit_is_payload_too_large() {
        let app = TestApp::new().await;
        let uri = format!("/api/thumbnail/{}", app.video.id);

        // The image alone fits; the extra field pushes the form past the limit.
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\n"
        )
        .into_bytes();
        body.extend(std::iter::repeat_n(b'n', 100 << 10));
        body.extend_from_slice(b"\r\n");
        body.extend(multipart_body(
            "thumbnail",
            "image/png",
            &vec![1u8; MAX_THUMBNAIL_BYTES as usize - 16],
        ));

        let response = app
            .router
            .clone()
            .oneshot(upload_request(&uri, Some(&app.owner_token()), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await["status"], 413);

        assert_eq!(app.records.get(app.video.id).await.unwrap().unwrap(), app.video);
        assert!(TestApp::is_empty(&app.staging));
        assert!(TestApp::is_empty(&app.assets));
    }

    #[tokio::test]
    async fn unknown_asset_is_404() {
        let app = TestApp::new().await;
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/assets/missing.png").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn asset_content_types() {
        use super::content_type_for;
        use crate::services::keys::StorageKey;
        assert_eq!(content_type_for(&StorageKey::from_raw("a/b.png")), "image/png");
        assert_eq!(content_type_for(&StorageKey::from_raw("b.JPEG")), "image/jpeg");
        assert_eq!(content_type_for(&StorageKey::from_raw("landscape/c.mp4")), "video/mp4");
        assert_eq!(
            content_type_for(&StorageKey::from_raw("noext")),
            "application/octet-stream"
        );
        assert_eq!(super::kind_for("video/mp4"), super::AssetKind::Video);
        assert_eq!(super::kind_for("image/png"), super::AssetKind::Thumbnail);
    }
}
