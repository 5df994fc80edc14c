use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Json, Multipart, OriginalUri, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use url::Url;

use crate::config::Settings;
use crate::cookies::{self, CookieError};
use crate::download::{DownloadError, DownloadJob, Downloader, JobStream};

// ============= Application State =============

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub downloader: Downloader,
}

impl AppState {
    pub fn new(settings: Settings, downloader: Downloader) -> Self {
        Self {
            settings: Arc::new(settings),
            downloader,
        }
    }
}

// ============= Errors =============

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<CookieError> for ApiError {
    fn from(err: CookieError) -> Self {
        match err {
            CookieError::MalformedReference(_) => Self::bad_request("Invalid cookies URL"),
            CookieError::NotFound(_) => Self::new(
                StatusCode::NOT_FOUND,
                "Cookies file for the given URL was not found",
            ),
            CookieError::InvalidFormat(message) => Self::bad_request(message),
            CookieError::Io(_) => Self::internal("Failed to save cookies"),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(_: DownloadError) -> Self {
        Self::internal("Failed to download video")
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), err.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ============= Request/Response Models =============

#[derive(Deserialize)]
pub struct VideoQuery {
    pub url: Option<String>,
    pub cookies_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct CookieUploadResponse {
    pub name: String,
}

// ============= Handlers =============

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /youtube/video — download a video and stream it back as mp4
async fn video_handler(
    State(state): State<AppState>,
    query: Result<Query<VideoQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let url = validate_video_url(query.url.as_deref())?;
    info!("Received download request for {url}");

    let cookies_file =
        cookies::resolve_reference(query.cookies_name.as_deref(), &state.settings.cookies_dir)?;

    let job = DownloadJob::create(&state.settings.temp_dir).map_err(|e| {
        error!("Failed to create job directory: {e}");
        DownloadError::Setup(e)
    })?;

    let downloader = state.downloader.clone();
    let task_url = url.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        downloader.run(job, &task_url, cookies_file.as_deref())
    })
    .await;

    let (job, file_path) = match outcome {
        Ok(Ok(done)) => done,
        Ok(Err(e)) => {
            error!("Failed to download video for {url}: {e}");
            return Err(DownloadError::from(e).into());
        }
        Err(e) => {
            error!("Download task for {url} panicked: {e}");
            return Err(DownloadError::Worker(e.to_string()).into());
        }
    };

    // On any early return below the job is dropped, which removes its directory.
    let file = File::open(&file_path).await.map_err(|e| {
        error!("Failed to open {}: {e}", file_path.display());
        DownloadError::Setup(e)
    })?;
    let length = file.metadata().await.ok().map(|m| m.len());
    let file_name = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video.mp4".to_string());

    info!("Serving video {} for {url}", file_path.display());
    let mut resp = Response::new(Body::from_stream(JobStream::new(file, job)));
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&file_name));
    if let Some(len) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    Ok(resp)
}

/// POST /youtube/cookies — store an uploaded cookies file
async fn cookies_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<CookieUploadResponse>)> {
    let mut multipart = multipart?;
    let mut file_name: Option<String> = None;
    let mut content: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file_name" => file_name = Some(field.text().await?),
            "file" => content = Some(field.bytes().await?.to_vec()),
            _ => {}
        }
    }

    let file_name = file_name.ok_or_else(|| ApiError::unprocessable("Field required: file_name"))?;
    let content = content.ok_or_else(|| ApiError::unprocessable("Field required: file"))?;

    let sanitized = cookies::sanitize_file_name(&file_name)
        .ok_or_else(|| ApiError::bad_request("File name must not be empty"))?;
    if content.is_empty() {
        return Err(ApiError::bad_request("Cookies file is empty"));
    }

    let destination = state.settings.cookies_dir.join(&sanitized);
    let target = destination.clone();
    let saved = tokio::task::spawn_blocking(move || cookies::save(&target, &content))
        .await
        .map_err(|e| {
            error!("Cookie save task panicked: {e}");
            ApiError::internal("Failed to save cookies")
        })?;

    match saved {
        Ok(path) => info!("Cookies file stored at {}", path.display()),
        Err(e @ CookieError::InvalidFormat(_)) => {
            warn!("Invalid cookies file {}: {e}", destination.display());
            return Err(e.into());
        }
        Err(e) => {
            error!("Failed to save cookies file {}: {e}", destination.display());
            return Err(ApiError::internal("Failed to save cookies"));
        }
    }

    let reference = format!("{}/{sanitized}", uri.path().trim_end_matches('/'));
    Ok((
        StatusCode::CREATED,
        Json(CookieUploadResponse { name: reference }),
    ))
}

/// 404 handler
async fn not_found_handler() -> impl IntoResponse {
    ApiError::new(StatusCode::NOT_FOUND, "Route not found")
}

// ============= Helpers =============

fn validate_video_url(raw: Option<&str>) -> ApiResult<String> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::unprocessable("Query parameter 'url' is required"))?;
    let url = Url::parse(raw).map_err(|e| ApiError::unprocessable(format!("Invalid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ApiError::unprocessable("URL must use http or https"));
    }
    Ok(url.to_string())
}

/// `attachment` disposition; names that are not plain ASCII go through the
/// RFC 5987 `filename*` form.
fn content_disposition(file_name: &str) -> HeaderValue {
    let plain = file_name
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\');
    let value = if plain {
        format!("attachment; filename=\"{file_name}\"")
    } else {
        format!(
            "attachment; filename*=utf-8''{}",
            urlencoding::encode(file_name)
        )
    };
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION, header::CONTENT_LENGTH])
}

// ============= Router =============

pub fn router(state: AppState) -> Router {
    let youtube = Router::new()
        .route("/youtube/video", get(video_handler))
        .route("/youtube/cookies", post(cookies_handler))
        .layer(DefaultBodyLimit::max(state.settings.max_upload_bytes));

    let prefix = state.settings.api_prefix.clone();
    let api = if prefix.is_empty() {
        youtube
    } else {
        Router::new().nest(&prefix, youtube)
    };

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .fallback(not_found_handler)
        .layer(cors())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::fakes::FakeEngine;
    use crate::sqlite_cookies::fixtures::firefox_db;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "ytserver-test-boundary";
    const JAR: &[u8] = b"Netscape HTTP Cookie File\n";

    struct TestApp {
        app: Router,
        engine: Arc<FakeEngine>,
        cookies: TempDir,
        tmp: TempDir,
    }

    fn test_app(engine: FakeEngine, prefix: &str) -> TestApp {
        let cookies = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        let vars: HashMap<&str, String> = HashMap::from([
            ("YOUTUBE_COOKIES_DIR", cookies.path().display().to_string()),
            ("DOWNLOAD_TMP_DIR", tmp.path().display().to_string()),
            ("API_PREFIX", prefix.to_string()),
        ]);
        let settings = Settings::from_lookup(|key| vars.get(key).cloned());
        let engine = Arc::new(engine);
        let state = AppState::new(settings, Downloader::new(engine.clone()));
        TestApp {
            app: router(state),
            engine,
            cookies,
            tmp,
        }
    }

    fn multipart(fields: &[(&str, &[u8])]) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            if *name == "file" {
                body.extend_from_slice(
                    b"Content-Disposition: form-data; name=\"file\"; filename=\"cookies.txt\"\r\n\
                      Content-Type: application/octet-stream\r\n\r\n",
                );
            } else {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
            }
            body.extend_from_slice(value);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    async fn upload(app: &Router, uri: &str, fields: &[(&str, &[u8])]) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(multipart(fields))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get(app: &Router, uri: &str) -> Response {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        app.clone().oneshot(req).await.unwrap()
    }

    fn job_dirs(tmp: &Path) -> usize {
        std::fs::read_dir(tmp).unwrap().count()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        let resp = get(&t.app, "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&bytes).unwrap(),
            serde_json::json!({ "status": "ok" })
        );
    }

    #[tokio::test]
    async fn upload_then_download_uses_saved_cookies() {
        let t = test_app(FakeEngine::ok("Great Clip", b"video-bytes"), "");

        let (status, body) = upload(&t.app, "/youtube/cookies", &[("file_name", b"a.txt"), ("file", JAR)]).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, serde_json::json!({ "name": "/youtube/cookies/a.txt" }));
        assert_eq!(std::fs::read(t.cookies.path().join("a.txt")).unwrap(), JAR);

        let resp = get(
            &t.app,
            "/youtube/video?url=https://www.youtube.com/watch?v%3Dabc&cookies_name=/youtube/cookies/a.txt",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Great Clip.mp4\""
        );
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "11");
        assert_eq!(job_dirs(t.tmp.path()), 1);

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"video-bytes");
        assert_eq!(job_dirs(t.tmp.path()), 0);
        assert_eq!(
            *t.engine.seen_cookies.lock().unwrap(),
            vec![Some(t.cookies.path().join("a.txt"))]
        );
    }

    #[tokio::test]
    async fn download_without_cookies_runs_unauthenticated() {
        let t = test_app(FakeEngine::ok("clip", b"x"), "");
        let resp = get(&t.app, "/youtube/video?url=https://youtu.be/abc").await;
        assert_eq!(resp.status(), StatusCode::OK);
        drop(resp);
        assert_eq!(job_dirs(t.tmp.path()), 0);
        assert_eq!(*t.engine.seen_cookies.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn sqlite_upload_is_converted() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        let db = firefox_db(&[(Some("example.com"), Some("/"), Some(0), Some(5), Some("n"), Some("v"), Some(1))]);

        let (status, _) = upload(&t.app, "/youtube/cookies", &[("file_name", b"ff.sqlite"), ("file", &db)]).await;

        assert_eq!(status, StatusCode::CREATED);
        let stored = std::fs::read_to_string(t.cookies.path().join("ff.sqlite")).unwrap();
        assert!(stored.ends_with("#HttpOnly_example.com\tFALSE\t/\tFALSE\t5\tn\tv\n"));
    }

    #[tokio::test]
    async fn upload_validation_errors() {
        let t = test_app(FakeEngine::ok("v", b""), "");

        let (status, _) = upload(&t.app, "/youtube/cookies", &[("file_name", b"a.txt"), ("file", b"")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = upload(&t.app, "/youtube/cookies", &[("file_name", b""), ("file", JAR)]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = upload(&t.app, "/youtube/cookies", &[("file_name", b"../"), ("file", JAR)]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            upload(&t.app, "/youtube/cookies", &[("file_name", b"a.txt"), ("file", b"plain text")]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("Netscape HTTP Cookie File"));

        let (status, _) = upload(&t.app, "/youtube/cookies", &[("file", JAR)]).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        assert_eq!(std::fs::read_dir(t.cookies.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn upload_strips_directories_from_name() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        let (status, body) =
            upload(&t.app, "/youtube/cookies", &[("file_name", b"../../evil.txt"), ("file", JAR)]).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "/youtube/cookies/evil.txt");
        assert!(t.cookies.path().join("evil.txt").is_file());
    }

    #[tokio::test]
    async fn missing_cookie_reference_is_404() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        let resp = get(&t.app, "/youtube/video?url=https://youtu.be/a&cookies_name=/youtube/cookies/nope.txt").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(job_dirs(t.tmp.path()), 0);
        assert!(t.engine.seen_cookies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unusable_cookie_reference_is_400() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        let resp = get(&t.app, "/youtube/video?url=https://youtu.be/a&cookies_name=/").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn extraction_failure_is_500_and_cleans_up() {
        let t = test_app(FakeEngine::failing("ERROR: Video unavailable"), "");
        let resp = get(&t.app, "/youtube/video?url=https://youtu.be/gone").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(job_dirs(t.tmp.path()), 0);
    }

    #[tokio::test]
    async fn invalid_video_url_is_422() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        for uri in ["/youtube/video", "/youtube/video?url=ftp://host/x", "/youtube/video?url=not-a-url"] {
            let resp = get(&t.app, uri).await;
            assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY, "{uri}");
        }
        assert!(t.engine.seen_cookies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn prefixed_routes_return_prefixed_reference() {
        let t = test_app(FakeEngine::ok("v", b"x"), "/api");
        let (status, body) = upload(&t.app, "/api/youtube/cookies", &[("file_name", b"a.txt"), ("file", JAR)]).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "/api/youtube/cookies/a.txt");

        let resp = get(&t.app, "/api/youtube/video?url=https://youtu.be/a&cookies_name=/api/youtube/cookies/a.txt").await;
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(get(&t.app, "/health").await.status(), StatusCode::OK);
        assert_eq!(get(&t.app, "/youtube/video?url=https://youtu.be/a").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_multipart_upload_is_json_400() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        let req = Request::builder()
            .method("POST")
            .uri("/youtube/cookies")
            .body(Body::from("file_name=a.txt"))
            .unwrap();
        let resp = t.app.clone().oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn malformed_query_is_json_400() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        let resp = get(&t.app, "/youtube/video?url=https://a.io/x&url=https://b.io/y").await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["detail"].as_str().unwrap().contains("url"));
        assert!(t.engine.seen_cookies.lock().unwrap().is_empty());
        assert_eq!(job_dirs(t.tmp.path()), 0);
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let t = test_app(FakeEngine::ok("v", b""), "");
        let resp = get(&t.app, "/nope").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["detail"], "Route not found");
    }

    #[test]
    fn non_ascii_titles_use_extended_filename() {
        assert_eq!(
            content_disposition("Привет.mp4"),
            "attachment; filename*=utf-8''%D0%9F%D1%80%D0%B8%D0%B2%D0%B5%D1%82.mp4"
        );
        assert_eq!(
            content_disposition("a \"b\".mp4"),
            "attachment; filename*=utf-8''a%20%22b%22.mp4"
        );
    }
}
