//! Ordered fallback across download backends.
//!
//! Each request walks the configured chain: probe the backend, attempt it
//! under a deadline, and either return its stream, stop on a terminal failure,
//! or move on. Nothing is remembered between requests; probes run every time.

pub mod external;
pub mod native;
pub mod tiktok;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    error::UpstreamError,
    model::{DownloadRequest, MediaFormat, Quality},
    stream::MediaStreamHandle,
};

pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait DownloadBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap local check; `false` skips the backend without counting an attempt.
    async fn probe(&self) -> bool;

    async fn fetch(&self, request: &DownloadRequest) -> Result<MediaStreamHandle, UpstreamError>;
}

pub struct DownloadOrchestrator {
    backends: Vec<Arc<dyn DownloadBackend>>,
    attempt_timeout: Duration,
    probe_timeout: Duration,
}

impl DownloadOrchestrator {
    pub fn new(backends: Vec<Arc<dyn DownloadBackend>>) -> Self {
        Self {
            backends,
            attempt_timeout: ATTEMPT_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// YouTube chain: external binary first unless the operator prefers the
    /// in-process client.
    pub fn for_youtube(
        prefer_external: bool,
        external: Arc<dyn DownloadBackend>,
        native: Arc<dyn DownloadBackend>,
    ) -> Self {
        let backends = if prefer_external {
            vec![external, native]
        } else {
            vec![native, external]
        };
        Self::new(backends)
    }

    pub fn with_timeouts(mut self, attempt: Duration, probe: Duration) -> Self {
        self.attempt_timeout = attempt;
        self.probe_timeout = probe;
        self
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    pub async fn download(
        &self,
        request: &DownloadRequest,
    ) -> Result<MediaStreamHandle, UpstreamError> {
        let video = request.identifier.to_string();
        let mut last_error: Option<UpstreamError> = None;

        for backend in &self.backends {
            let name = backend.name();
            match timeout(self.probe_timeout, backend.probe()).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(backend = name, %video, "backend unavailable, skipping");
                    continue;
                }
                Err(_) => {
                    warn!(backend = name, %video, "backend probe timed out, skipping");
                    continue;
                }
            }

            debug!(backend = name, %video, quality = request.quality.as_str(), "attempting download");
            let outcome = match timeout(self.attempt_timeout, backend.fetch(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(UpstreamError::timeout(&format!("Download via {name}"))),
            };

            match outcome {
                Ok(handle) => {
                    info!(backend = name, %video, title = handle.title(), "download started");
                    return Ok(handle);
                }
                Err(err) if err.is_terminal() => {
                    warn!(backend = name, %video, kind = %err.kind(), error = err.message(), "terminal failure, not falling back");
                    return Err(err);
                }
                Err(err) => {
                    warn!(backend = name, %video, kind = %err.kind(), error = err.message(), "attempt failed, trying next backend");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            warn!(%video, "no download backend usable");
            UpstreamError::extraction(
                "The download service is unavailable: no download backend is usable on this server.",
            )
            .with_reason("noBackend")
        }))
    }
}

/// `yt-dlp -f` expression; quality is a ceiling, never an exact match.
pub fn ytdlp_format_selector(quality: Quality, format: MediaFormat) -> String {
    match format {
        MediaFormat::Mp3 => "bestaudio[ext=m4a]/bestaudio".to_string(),
        MediaFormat::Mp4 => {
            let height = quality.max_height();
            format!("best[height<={height}][ext=mp4]/best[height<={height}]")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityHint {
    Highest,
    Lowest,
}

/// Stream choice for the native client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeSelection {
    pub audio_only: bool,
    pub max_height: u32,
    pub hint: QualityHint,
}

impl NativeSelection {
    pub fn for_request(request: &DownloadRequest) -> Self {
        Self {
            audio_only: request.format.is_audio(),
            max_height: request.quality.max_height(),
            hint: QualityHint::Highest,
        }
    }
}
