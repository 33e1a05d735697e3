//! TikTok page scraping.
//!
//! TikTok has no public video API, so each scrape renders the page in a
//! browser of its own and reads the state blob the page embeds. Short links
//! are resolved over plain HTTP first so a malformed link never costs a
//! browser launch.

pub mod browser;
pub mod extract;

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::header;
use regex::Regex;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

use crate::{
    error::UpstreamError,
    model::{ScrapedVideoRecord, is_tiktok_host},
    normalize::classify_transport,
};

pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_REDIRECTS: usize = 5;
pub const DEFAULT_SHORT_LINK_HOSTS: &[&str] = &["vm.tiktok.com", "vt.tiktok.com"];
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

// Slack on top of the navigation timeout for browser launch and teardown.
const RENDER_GRACE: Duration = Duration::from_secs(15);

static VIDEO_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/@[^/]+/video/\d+/?$").unwrap());

/// HTML and cookies of a fully loaded page.
#[derive(Debug, Clone, Default)]
pub struct RenderedPage {
    pub html: String,
    pub cookie_header: Option<String>,
}

/// Loads a page in a real browser. Each call owns its browser for its whole
/// lifetime and tears it down before returning.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(
        &self,
        url: &Url,
        user_agent: &str,
        navigation_timeout: Duration,
    ) -> Result<RenderedPage, UpstreamError>;
}

pub struct TikTokScraper {
    http: reqwest::Client,
    renderer: Arc<dyn PageRenderer>,
    short_link_hosts: Arc<Vec<String>>,
    navigation_timeout: Duration,
    render_deadline: Duration,
    user_agent: String,
}

impl TikTokScraper {
    pub fn new(renderer: Arc<dyn PageRenderer>) -> Result<Self> {
        let hosts = DEFAULT_SHORT_LINK_HOSTS
            .iter()
            .map(|host| host.to_string())
            .collect();
        Self::with_short_link_hosts(renderer, hosts)
    }

    pub fn with_short_link_hosts(
        renderer: Arc<dyn PageRenderer>,
        hosts: Vec<String>,
    ) -> Result<Self> {
        let short_link_hosts = Arc::new(hosts);
        let policy_hosts = short_link_hosts.clone();
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if is_short_link(attempt.url(), &policy_hosts) {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });
        let http = reqwest::Client::builder()
            .redirect(policy)
            .timeout(Duration::from_secs(10))
            .build()
            .context("building short-link HTTP client")?;
        Ok(Self {
            http,
            renderer,
            short_link_hosts,
            navigation_timeout: NAVIGATION_TIMEOUT,
            render_deadline: NAVIGATION_TIMEOUT + RENDER_GRACE,
            user_agent: DESKTOP_USER_AGENT.to_string(),
        })
    }

    pub fn with_navigation_timeout(mut self, navigation_timeout: Duration) -> Self {
        self.navigation_timeout = navigation_timeout;
        self.render_deadline = navigation_timeout + RENDER_GRACE;
        self
    }

    /// Hard cap on one whole render, launch and teardown included.
    pub fn with_render_deadline(mut self, render_deadline: Duration) -> Self {
        self.render_deadline = render_deadline;
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn scrape(&self, raw_url: &str) -> Result<ScrapedVideoRecord, UpstreamError> {
        let canonical = self.normalize_url(raw_url).await?;
        info!(url = %canonical, "rendering TikTok page");

        let render = self
            .renderer
            .render(&canonical, &self.user_agent, self.navigation_timeout);
        let page = timeout(self.render_deadline, render)
            .await
            .map_err(|_| UpstreamError::timeout("TikTok page load"))??;
        debug!(url = %canonical, bytes = page.html.len(), "TikTok page rendered");

        let mut record = extract::extract_record(&page.html)?;
        record.session_cookie = page.cookie_header;
        Ok(record)
    }

    /// Resolves short links and checks the result is a single-video URL.
    pub async fn normalize_url(&self, raw_url: &str) -> Result<Url, UpstreamError> {
        let url = Url::parse(raw_url.trim()).map_err(|_| {
            UpstreamError::invalid_input(format!("{raw_url:?} is not a valid URL."))
                .with_reason("invalidUrl")
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UpstreamError::invalid_input("TikTok URLs must use http or https.")
                .with_reason("invalidUrl"));
        }

        let resolved = if is_short_link(&url, &self.short_link_hosts) {
            self.follow_short_link(url).await?
        } else {
            url
        };
        canonical_video_url(resolved)
    }

    async fn follow_short_link(&self, url: Url) -> Result<Url, UpstreamError> {
        debug!(url = %url, "resolving TikTok short link");
        let response = self
            .http
            .get(url)
            .header(header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|err| {
                if err.is_redirect() {
                    UpstreamError::invalid_input(format!(
                        "The short link did not resolve within {MAX_REDIRECTS} redirects."
                    ))
                    .with_reason("redirectLoop")
                } else {
                    classify_transport(&err, "TikTok short link resolution")
                }
            })?;

        if !response.status().is_redirection() {
            return Ok(response.url().clone());
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                UpstreamError::invalid_input("The short link redirect had no target.")
                    .with_reason("invalidUrl")
            })?;
        response.url().join(location).map_err(|_| {
            UpstreamError::invalid_input("The short link redirected to an invalid URL.")
                .with_reason("invalidUrl")
        })
    }
}

/// Short-link hosts, or `/t/<code>` paths on the main site.
fn is_short_link(url: &Url, hosts: &[String]) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    hosts.iter().any(|short| short.eq_ignore_ascii_case(host))
        || (is_tiktok_host(host) && url.path().starts_with("/t/"))
}

/// Accepts `https://<tiktok host>/@<user>/video/<digits>` and drops query and
/// fragment.
pub fn canonical_video_url(mut url: Url) -> Result<Url, UpstreamError> {
    let host = url.host_str().unwrap_or_default();
    if !is_tiktok_host(host) {
        return Err(UpstreamError::invalid_input(format!(
            "{host:?} is not a TikTok host."
        ))
        .with_reason("invalidUrl"));
    }
    if !VIDEO_PATH_RE.is_match(url.path()) {
        return Err(UpstreamError::invalid_input(
            "The URL does not point to a single TikTok video (expected /@user/video/<id>).",
        )
        .with_reason("invalidUrl"));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
