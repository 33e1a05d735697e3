use std::{io, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::header;
use futures::{StreamExt, TryStreamExt};
use tracing::debug;

use super::DownloadBackend;
use crate::{
    error::UpstreamError,
    model::DownloadRequest,
    normalize::{classify_media_status, classify_transport},
    scraper::TikTokScraper,
    stream::MediaStreamHandle,
};

const TIKTOK_REFERER: &str = "https://www.tiktok.com/";

/// Scrapes the page, then streams the media URL it exposes. The CDN only
/// honours the URL together with the scrape's cookies and user agent.
pub struct TikTokBackend {
    scraper: Arc<TikTokScraper>,
    client: reqwest::Client,
}

impl TikTokBackend {
    pub fn new(scraper: Arc<TikTokScraper>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building TikTok media HTTP client")?;
        Ok(Self { scraper, client })
    }
}

#[async_trait]
impl DownloadBackend for TikTokBackend {
    fn name(&self) -> &'static str {
        "tiktok-scraper"
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn fetch(&self, request: &DownloadRequest) -> Result<MediaStreamHandle, UpstreamError> {
        let record = self
            .scraper
            .scrape(request.identifier.source_url())
            .await?;
        let Some(media_url) = record.media_url(request.watermark_free) else {
            return Err(UpstreamError::extraction(
                "The TikTok page exposed no media address.",
            ));
        };
        debug!(
            video_id = %record.platform_video_id,
            watermark_free = request.watermark_free,
            "fetching TikTok media"
        );

        let mut media = self
            .client
            .get(media_url)
            .header(header::USER_AGENT, self.scraper.user_agent())
            .header(header::REFERER, TIKTOK_REFERER);
        if let Some(cookie) = &record.session_cookie {
            media = media.header(header::COOKIE, cookie);
        }
        let response = media
            .send()
            .await
            .map_err(|err| classify_transport(&err, "TikTok media download"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_media_status(status));
        }

        let title = if record.description.trim().is_empty() {
            format!("tiktok_{}", record.platform_video_id)
        } else {
            record.description.clone()
        };
        let body = response.bytes_stream().map_err(io::Error::other).boxed();
        Ok(MediaStreamHandle::new(body, title, request.format))
    }
}
