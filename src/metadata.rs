//! YouTube Data API lookups.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::RelayConfig,
    error::UpstreamError,
    model::{Platform, VideoIdentifier},
    normalize::{classify_api_error, classify_transport},
};

pub const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const VIDEO_PARTS: &str = "snippet,contentDetails,statistics";

/// Stateless client for `GET /videos`. Cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct MetadataResolver {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

impl MetadataResolver {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        Self::with_timeout(config, METADATA_TIMEOUT)
    }

    pub fn with_timeout(config: &RelayConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building metadata HTTP client")?;
        Ok(Self {
            client,
            api_base: config.youtube_api_base.trim_end_matches('/').to_string(),
            api_key: config.youtube_api_key.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Validates `raw` as a YouTube id, then resolves it.
    pub async fn resolve_id(&self, raw: &str) -> Result<Value, UpstreamError> {
        let identifier = VideoIdentifier::youtube(raw)?;
        self.resolve(&identifier).await
    }

    /// Returns the first `items` entry of the API response untouched.
    pub async fn resolve(&self, identifier: &VideoIdentifier) -> Result<Value, UpstreamError> {
        if identifier.platform() != Platform::Youtube {
            return Err(UpstreamError::invalid_input(
                "Metadata lookups are only available for YouTube videos.",
            ));
        }
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(UpstreamError::auth(
                "The server has no YouTube API key configured.",
            )
            .with_status(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
            .with_reason("missingApiKey"));
        };

        debug!(video_id = identifier.id(), "querying YouTube Data API");
        let response = self
            .client
            .get(format!("{}/videos", self.api_base))
            .query(&[
                ("part", VIDEO_PARTS),
                ("id", identifier.id()),
                ("key", api_key),
            ])
            .send()
            .await
            .map_err(|err| classify_transport(&err, "YouTube metadata lookup"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| classify_transport(&err, "YouTube metadata lookup"))?;
        if !status.is_success() {
            let err = classify_api_error(status, &body);
            warn!(
                video_id = identifier.id(),
                %status,
                reason = err.raw_reason().unwrap_or("-"),
                "metadata lookup rejected"
            );
            return Err(err);
        }

        let mut payload: Value = serde_json::from_str(&body).map_err(|err| {
            UpstreamError::internal("The YouTube API returned a malformed response.")
                .with_details(err.to_string())
        })?;
        payload
            .get_mut("items")
            .and_then(Value::as_array_mut)
            .filter(|items| !items.is_empty())
            .map(|items| items.swap_remove(0))
            .ok_or_else(|| {
                UpstreamError::not_found(
                    "Video not found. It may have been deleted or made private.",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, testing};
    use axum::{
        Json, Router,
        extract::{Query, State},
        http::StatusCode,
        response::IntoResponse,
        routing::get,
    };
    use serde_json::json;
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    #[derive(Clone)]
    struct FakeApi {
        hits: Arc<AtomicUsize>,
    }

    async fn videos(
        State(api): State<FakeApi>,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        api.hits.fetch_add(1, Ordering::SeqCst);
        assert_eq!(params.get("part").map(String::as_str), Some(VIDEO_PARTS));
        match params.get("id").map(String::as_str) {
            Some("dQw4w9WgXcQ") => Json(json!({
                "kind": "youtube#videoListResponse",
                "items": [{ "id": "dQw4w9WgXcQ", "snippet": { "title": "Never Gonna" } }]
            }))
            .into_response(),
            Some("quotaQuota1") => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": {
                        "code": 403,
                        "message": "quota",
                        "errors": [{ "reason": "quotaExceeded" }]
                    }
                })),
            )
                .into_response(),
            Some("slowSlowSlo") => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "items": [] })).into_response()
            }
            _ => Json(json!({ "kind": "youtube#videoListResponse", "items": [] })).into_response(),
        }
    }

    async fn fake_api() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route("/v3/videos", get(videos))
            .with_state(FakeApi { hits: hits.clone() });
        (format!("{}/v3", testing::serve(router).await), hits)
    }

    fn resolver(base: &str, key: Option<&str>) -> MetadataResolver {
        let config = RelayConfig {
            youtube_api_base: base.to_string(),
            youtube_api_key: key.map(str::to_string),
            ..RelayConfig::default()
        };
        MetadataResolver::with_timeout(&config, Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn returns_first_item_verbatim() {
        let (base, hits) = fake_api().await;
        let item = resolver(&base, Some("key")).resolve_id("dQw4w9WgXcQ").await.unwrap();
        assert_eq!(item["snippet"]["title"], "Never Gonna");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_ids_never_reach_the_network() {
        let (base, hits) = fake_api().await;
        let resolver = resolver(&base, Some("key"));
        for raw in ["", "short", "dQw4w9WgXcQ!", "dQw4w9WgXcQdQw4"] {
            let err = resolver.resolve_id(raw).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InputValidationError);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tiktok_identifiers_are_rejected() {
        let (base, hits) = fake_api().await;
        let id = VideoIdentifier::tiktok("https://www.tiktok.com/@a/video/123").unwrap();
        let err = resolver(&base, Some("key")).resolve(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputValidationError);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_items_is_not_found() {
        let (base, _) = fake_api().await;
        let err = resolver(&base, Some("key")).resolve_id("aaaaaaaaaaa").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamNotFoundError);
        assert_eq!(err.http_status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn quota_error_is_auth_with_hint() {
        let (base, _) = fake_api().await;
        let err = resolver(&base, Some("key")).resolve_id("quotaQuota1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamAuthError);
        assert_eq!(err.http_status(), StatusCode::FORBIDDEN);
        assert!(err.message().contains("quota"));
    }

    #[tokio::test]
    async fn missing_key_fails_without_request() {
        let (base, hits) = fake_api().await;
        let resolver = resolver(&base, None);
        assert!(!resolver.is_configured());
        let err = resolver.resolve_id("dQw4w9WgXcQ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamAuthError);
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.raw_reason(), Some("missingApiKey"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_api_is_network_error() {
        let base = testing::closed_port_url().await;
        let err = resolver(&base, Some("key")).resolve_id("dQw4w9WgXcQ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(err.http_status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn slow_api_times_out_with_504() {
        let (base, _) = fake_api().await;
        let err = resolver(&base, Some("key")).resolve_id("slowSlowSlo").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(err.http_status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
