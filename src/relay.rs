//! HTTP surface: parameter validation, error bodies and the streaming pipe.
//!
//! Handlers check every parameter before touching a downstream component, so
//! a malformed request never spends an API call, a subprocess or a browser.
//! Download responses are piped straight from the backend stream; the
//! headers go out before the first byte and nothing is buffered here.

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use anyhow::Result;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::SecondsFormat;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    config::RelayConfig,
    download::{
        DownloadBackend, DownloadOrchestrator, PROBE_TIMEOUT, external::ExternalBinaryBackend,
        native::NativeBackend, tiktok::TikTokBackend,
    },
    error::{ErrorBody, ErrorKind, UpstreamError},
    metadata::MetadataResolver,
    model::{DownloadRequest, MediaFormat, Quality, ScrapedVideoRecord, VideoIdentifier},
    scraper::{TikTokScraper, browser::HeadlessChromeRenderer},
    stream::{ByteStream, MediaStreamHandle},
};

/// Shared per-process state. Everything in here is immutable or a cloneable
/// client; requests never coordinate through it.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<MetadataResolver>,
    pub youtube: Arc<DownloadOrchestrator>,
    pub tiktok: Arc<DownloadOrchestrator>,
    pub scraper: Arc<TikTokScraper>,
    pub external: Arc<dyn DownloadBackend>,
    pub prefer_external_downloader: bool,
    /// Bound on the health check's downloader probe.
    pub probe_timeout: Duration,
}

impl AppState {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let resolver = Arc::new(MetadataResolver::new(config)?);
        let external: Arc<dyn DownloadBackend> =
            Arc::new(ExternalBinaryBackend::new(&config.ytdlp_binary));
        let native: Arc<dyn DownloadBackend> = Arc::new(NativeBackend::new(config)?);
        let youtube = Arc::new(DownloadOrchestrator::for_youtube(
            config.prefer_external_downloader,
            external.clone(),
            native,
        ));

        let renderer = Arc::new(HeadlessChromeRenderer::new(config.chrome_path.clone()));
        let scraper = Arc::new(TikTokScraper::new(renderer)?);
        let tiktok_backend: Arc<dyn DownloadBackend> =
            Arc::new(TikTokBackend::new(scraper.clone())?);
        let tiktok = Arc::new(DownloadOrchestrator::new(vec![tiktok_backend]));

        Ok(Self {
            resolver,
            youtube,
            tiktok,
            scraper,
            external,
            prefer_external_downloader: config.prefer_external_downloader,
            probe_timeout: PROBE_TIMEOUT,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/youtube", get(youtube_metadata))
        .route("/api/youtube/download", get(youtube_download))
        .route("/api/tiktok", get(tiktok_metadata))
        .route("/api/tiktok/download", get(tiktok_download))
        .route("/api/health", get(health))
        .fallback(unknown_endpoint)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        Self {
            status: err.http_status(),
            body: err.body(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// TikTok endpoints report validation problems as 400 and everything else as
/// 500, with the classified kind in `reason` and the raw cause in `details`.
fn tiktok_error(headline: &str, err: UpstreamError) -> ApiError {
    if err.kind() == ErrorKind::InputValidationError {
        return err.into();
    }
    warn!(kind = %err.kind(), error = err.message(), "TikTok request failed");
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorBody {
            error: headline.to_string(),
            message: err.message().to_string(),
            reason: Some(err.kind().as_str().to_string()),
            details: Some(
                err.details()
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
            ),
        },
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, UpstreamError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            UpstreamError::invalid_input(format!("Missing required parameter: {name}"))
                .with_reason("missingParameter")
        })
}

#[derive(Debug, Default, Deserialize)]
struct YoutubeQuery {
    id: Option<String>,
    quality: Option<String>,
    format: Option<String>,
}

impl YoutubeQuery {
    fn download_request(&self) -> Result<DownloadRequest, UpstreamError> {
        let identifier = VideoIdentifier::youtube(required(self.id.as_deref(), "id")?)?;
        let quality = match self.quality.as_deref() {
            None => Quality::default(),
            Some(raw) => Quality::parse(raw).ok_or_else(|| {
                UpstreamError::invalid_input(format!(
                    "Unsupported quality {raw:?}. Use 360p, 480p, 720p or 1080p."
                ))
                .with_reason("invalidQuality")
            })?,
        };
        let format = match self.format.as_deref() {
            None => MediaFormat::default(),
            Some(raw) => MediaFormat::parse(raw).ok_or_else(|| {
                UpstreamError::invalid_input(format!(
                    "Unsupported format {raw:?}. Use mp4 or mp3."
                ))
                .with_reason("invalidFormat")
            })?,
        };
        Ok(DownloadRequest::new(identifier)
            .with_quality(quality)
            .with_format(format))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TiktokQuery {
    id: Option<String>,
    url: Option<String>,
    watermark_free: Option<String>,
}

impl TiktokQuery {
    /// `url` wins over `id`; either must be a full TikTok URL.
    fn identifier(&self) -> Result<VideoIdentifier, UpstreamError> {
        let raw = required(self.url.as_deref().or(self.id.as_deref()), "url")?;
        VideoIdentifier::tiktok(raw)
    }

    fn watermark_free(&self) -> Result<bool, UpstreamError> {
        match self.watermark_free.as_deref().map(str::trim) {
            None | Some("") => Ok(false),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(UpstreamError::invalid_input(format!(
                    "watermarkFree must be true or false, got {raw:?}."
                ))
                .with_reason("invalidParameter")),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TiktokVideoResponse {
    video_id: String,
    description: String,
    thumbnail: Option<String>,
    author: Option<String>,
    like_count: u64,
    share_count: u64,
    comment_count: u64,
    upload_date: Option<String>,
    video_url: Option<String>,
}

impl From<ScrapedVideoRecord> for TiktokVideoResponse {
    fn from(record: ScrapedVideoRecord) -> Self {
        let video_url = record.media_url(true).map(str::to_string);
        Self {
            video_id: record.platform_video_id,
            description: record.description,
            thumbnail: record.cover_url,
            author: record.author,
            like_count: record.stats.likes,
            share_count: record.stats.shares,
            comment_count: record.stats.comments,
            upload_date: record
                .created_at
                .map(|created| created.to_rfc3339_opts(SecondsFormat::Secs, true)),
            video_url,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    external_downloader: bool,
    prefer_external_downloader: bool,
    metadata_api_configured: bool,
}

async fn youtube_metadata(
    State(state): State<AppState>,
    Query(query): Query<YoutubeQuery>,
) -> ApiResult<Json<Value>> {
    let id = required(query.id.as_deref(), "id")?;
    let item = state.resolver.resolve_id(id).await?;
    Ok(Json(item))
}

async fn youtube_download(
    State(state): State<AppState>,
    Query(query): Query<YoutubeQuery>,
) -> ApiResult<Response> {
    let request = query.download_request()?;
    info!(
        video = %request.identifier,
        quality = request.quality.as_str(),
        format = request.format.extension(),
        "YouTube download requested"
    );
    let handle = state.youtube.download(&request).await?;
    Ok(stream_response(handle, request.identifier.to_string()))
}

async fn tiktok_metadata(
    State(state): State<AppState>,
    Query(query): Query<TiktokQuery>,
) -> ApiResult<Json<TiktokVideoResponse>> {
    const HEADLINE: &str = "Failed to fetch TikTok video";
    let identifier = query
        .identifier()
        .map_err(|err| tiktok_error(HEADLINE, err))?;
    let record = state
        .scraper
        .scrape(identifier.source_url())
        .await
        .map_err(|err| tiktok_error(HEADLINE, err))?;
    Ok(Json(record.into()))
}

async fn tiktok_download(
    State(state): State<AppState>,
    Query(query): Query<TiktokQuery>,
) -> ApiResult<Response> {
    const HEADLINE: &str = "Failed to download TikTok video";
    let identifier = query
        .identifier()
        .map_err(|err| tiktok_error(HEADLINE, err))?;
    let watermark_free = query
        .watermark_free()
        .map_err(|err| tiktok_error(HEADLINE, err))?;
    let request = DownloadRequest::new(identifier).with_watermark_free(watermark_free);
    info!(video = %request.identifier, watermark_free, "TikTok download requested");
    let handle = state
        .tiktok
        .download(&request)
        .await
        .map_err(|err| tiktok_error(HEADLINE, err))?;
    Ok(stream_response(handle, request.identifier.to_string()))
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        external_downloader: timeout(state.probe_timeout, state.external.probe())
            .await
            .unwrap_or(false),
        prefer_external_downloader: state.prefer_external_downloader,
        metadata_api_configured: state.resolver.is_configured(),
    })
}

async fn unknown_endpoint() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        body: ErrorBody {
            error: "Not found".to_string(),
            message: "endpoint not found".to_string(),
            reason: None,
            details: None,
        },
    }
}

fn stream_response(handle: MediaStreamHandle, label: String) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", handle.suggested_filename());
    let content_type = handle.content_type().to_string();
    let body = RelayStream::new(handle.into_body(), label);
    let mut response = Body::from_stream(body).into_response();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Pass-through body that reports how the transfer ended. Dropping it drops
/// the backend stream, which is what stops a download when the client leaves.
struct RelayStream {
    inner: ByteStream,
    label: String,
    bytes: u64,
    finished: bool,
}

impl RelayStream {
    fn new(inner: ByteStream, label: String) -> Self {
        Self {
            inner,
            label,
            bytes: 0,
            finished: false,
        }
    }
}

impl Stream for RelayStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => this.bytes += chunk.len() as u64,
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                warn!(video = %this.label, bytes = this.bytes, error = %err, "stream failed mid-transfer");
            }
            Poll::Ready(None) => {
                this.finished = true;
                info!(video = %this.label, bytes = this.bytes, "stream completed");
            }
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.finished {
            info!(video = %self.label, bytes = self.bytes, "client disconnected, aborting download");
        }
    }
}
