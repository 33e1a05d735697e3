//! In-process YouTube downloader built on the InnerTube `player` endpoint.
//!
//! The ANDROID client context returns plain stream URLs for most videos, so
//! no signature deciphering is needed. Formats that only come with a
//! `signatureCipher` are ignored. The selected stream is downloaded into a
//! per-request temp dir and served from there.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::header;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::debug;

use super::{DownloadBackend, NativeSelection, QualityHint};
use crate::{
    config::RelayConfig,
    error::UpstreamError,
    model::DownloadRequest,
    normalize::{classify_media_status, classify_playability, classify_transport},
    stream::MediaStreamHandle,
};

const CLIENT_NAME: &str = "ANDROID";
const CLIENT_VERSION: &str = "20.10.38";
const ANDROID_SDK_VERSION: u32 = 30;
const ANDROID_USER_AGENT: &str =
    "com.google.android.youtube/20.10.38 (Linux; U; Android 11) gzip";
const PLAYER_TIMEOUT: Duration = Duration::from_secs(15);
const TEMP_PREFIX: &str = "mediarelay-";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerResponse {
    playability_status: Option<PlayabilityStatus>,
    streaming_data: Option<StreamingData>,
    video_details: Option<VideoDetails>,
}

#[derive(Debug, Deserialize)]
struct PlayabilityStatus {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingData {
    #[serde(default)]
    formats: Vec<PlayerFormat>,
    #[serde(default)]
    adaptive_formats: Vec<PlayerFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerFormat {
    itag: u32,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    bitrate: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VideoDetails {
    #[serde(default)]
    title: Option<String>,
}

/// One directly downloadable stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCandidate {
    pub itag: u32,
    pub url: String,
    pub height: Option<u32>,
    pub bitrate: u64,
    pub has_video: bool,
    pub has_audio: bool,
    /// `audio/mp4` (AAC) rather than WebM/Opus.
    pub mpeg_audio: bool,
}

impl StreamCandidate {
    fn is_muxed(&self) -> bool {
        self.has_video && self.has_audio
    }
}

fn candidates(data: StreamingData) -> Vec<StreamCandidate> {
    let muxed = data.formats.into_iter().map(|format| (format, true));
    let adaptive = data.adaptive_formats.into_iter().map(|format| (format, false));
    muxed
        .chain(adaptive)
        .filter_map(|(format, is_muxed)| {
            let url = format.url?;
            let is_audio = format.mime_type.starts_with("audio/");
            Some(StreamCandidate {
                itag: format.itag,
                url,
                height: format.height,
                bitrate: format.bitrate.unwrap_or_default(),
                has_video: is_muxed || !is_audio,
                has_audio: is_muxed || is_audio,
                mpeg_audio: format.mime_type.starts_with("audio/mp4"),
            })
        })
        .collect()
}

/// Picks the stream for `selection` and reports which rule matched.
pub fn select_stream(
    candidates: &[StreamCandidate],
    selection: NativeSelection,
) -> Option<(&StreamCandidate, QualityHint)> {
    if selection.audio_only {
        return candidates
            .iter()
            .filter(|candidate| candidate.has_audio && !candidate.has_video)
            .max_by_key(|candidate| (candidate.mpeg_audio, candidate.bitrate))
            .map(|candidate| (candidate, QualityHint::Highest));
    }

    let muxed = || candidates.iter().filter(|candidate| candidate.is_muxed());
    let under_ceiling = muxed()
        .filter(|candidate| {
            candidate
                .height
                .is_some_and(|height| height <= selection.max_height)
        })
        .max_by_key(|candidate| (candidate.height, candidate.bitrate));
    match (selection.hint, under_ceiling) {
        (QualityHint::Highest, Some(candidate)) => Some((candidate, QualityHint::Highest)),
        _ => muxed()
            .min_by_key(|candidate| (candidate.height.unwrap_or(u32::MAX), candidate.bitrate))
            .map(|candidate| (candidate, QualityHint::Lowest)),
    }
}

pub struct NativeBackend {
    client: reqwest::Client,
    innertube_base: String,
    scratch_root: PathBuf,
}

impl NativeBackend {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(ANDROID_USER_AGENT)
            .connect_timeout(PLAYER_TIMEOUT)
            .build()
            .context("building InnerTube HTTP client")?;
        Ok(Self {
            client,
            innertube_base: config.innertube_base.trim_end_matches('/').to_string(),
            scratch_root: std::env::temp_dir(),
        })
    }

    /// Parent directory for per-request temp dirs.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    async fn player(&self, video_id: &str) -> Result<PlayerResponse, UpstreamError> {
        let payload = json!({
            "videoId": video_id,
            "context": {
                "client": {
                    "clientName": CLIENT_NAME,
                    "clientVersion": CLIENT_VERSION,
                    "androidSdkVersion": ANDROID_SDK_VERSION,
                    "hl": "en",
                    "gl": "US",
                }
            },
            "contentCheckOk": true,
            "racyCheckOk": true,
        });
        let response = self
            .client
            .post(format!("{}/player", self.innertube_base))
            .query(&[("prettyPrint", "false")])
            .timeout(PLAYER_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|err| classify_transport(&err, "YouTube player request"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_media_status(status));
        }
        response.json::<PlayerResponse>().await.map_err(|err| {
            UpstreamError::extraction(
                "The YouTube player response changed shape; the native client likely needs updating.",
            )
            .with_details(err.to_string())
        })
    }

    async fn download_to(&self, url: &str, file: &mut File) -> Result<u64, UpstreamError> {
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "*/*")
            .send()
            .await
            .map_err(|err| classify_transport(&err, "YouTube stream download"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_media_status(status));
        }

        let mut written = 0u64;
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk =
                chunk.map_err(|err| classify_transport(&err, "YouTube stream download"))?;
            file.write_all(&chunk).await.map_err(scratch_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(scratch_error)?;
        Ok(written)
    }
}

fn scratch_error(err: std::io::Error) -> UpstreamError {
    UpstreamError::internal("Writing the temporary media file failed.")
        .with_details(err.to_string())
}

#[async_trait]
impl DownloadBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn fetch(&self, request: &DownloadRequest) -> Result<MediaStreamHandle, UpstreamError> {
        let video_id = request.identifier.id();
        let player = self.player(video_id).await?;

        if let Some(playability) = &player.playability_status
            && playability.status != "OK"
        {
            return Err(classify_playability(
                &playability.status,
                playability.reason.as_deref(),
            ));
        }

        let title = player
            .video_details
            .and_then(|details| details.title)
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| request.identifier.default_title());
        let streams = candidates(player.streaming_data.unwrap_or_default());
        let selection = NativeSelection::for_request(request);
        let Some((stream, hint)) = select_stream(&streams, selection) else {
            return Err(UpstreamError::extraction(
                "The native client found no directly downloadable stream for this video.",
            )
            .with_reason("noDirectStream"));
        };
        debug!(video_id, itag = stream.itag, height = ?stream.height, ?hint, "native stream selected");

        let scope = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&self.scratch_root)
            .map_err(scratch_error)?;
        let path = scope
            .path()
            .join(format!("media.{}", request.format.extension()));
        let mut file = File::create(&path).await.map_err(scratch_error)?;
        // On any early return `scope` drops and removes the partial file.
        let written = self.download_to(&stream.url, &mut file).await?;
        drop(file);
        debug!(video_id, bytes = written, "native download buffered");

        let file = File::open(&path).await.map_err(scratch_error)?;
        Ok(MediaStreamHandle::from_temp_file(
            file,
            scope,
            title,
            request.format,
        ))
    }
}
