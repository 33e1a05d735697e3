use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use crate::error::UpstreamError;

pub const YOUTUBE_ID_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Tiktok,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Tiktok => "tiktok",
        }
    }
}

/// A validated reference to one video. Only the constructors below can build
/// one, so holding a `VideoIdentifier` means the shape checks already passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoIdentifier {
    platform: Platform,
    id: String,
    source_url: String,
}

impl VideoIdentifier {
    pub fn youtube(raw: &str) -> Result<Self, UpstreamError> {
        if !is_valid_youtube_id(raw) {
            return Err(UpstreamError::invalid_input(format!(
                "Invalid YouTube video id {raw:?}: expected {YOUTUBE_ID_LEN} characters of letters, digits, '-' or '_'."
            ))
            .with_reason("invalidVideoId"));
        }
        Ok(Self {
            platform: Platform::Youtube,
            id: raw.to_string(),
            source_url: format!("https://www.youtube.com/watch?v={raw}"),
        })
    }

    /// Accepts full TikTok URLs only. A bare numeric id cannot be turned into a
    /// page URL without the owning username.
    pub fn tiktok(raw: &str) -> Result<Self, UpstreamError> {
        let raw = raw.trim();
        if !raw.is_empty() && raw.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(UpstreamError::invalid_input(
                "A bare TikTok video id cannot be resolved. Pass the full video URL instead.",
            )
            .with_reason("bareVideoId"));
        }
        let url = Url::parse(raw).map_err(|_| {
            UpstreamError::invalid_input(format!("{raw:?} is not a valid TikTok URL."))
                .with_reason("invalidUrl")
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UpstreamError::invalid_input(
                "TikTok URLs must use http or https.",
            )
            .with_reason("invalidUrl"));
        }
        let host = url.host_str().unwrap_or_default();
        if !is_tiktok_host(host) {
            return Err(UpstreamError::invalid_input(format!(
                "{host:?} is not a TikTok host."
            ))
            .with_reason("invalidUrl"));
        }

        let id = tiktok_video_id(&url)
            .or_else(|| {
                url.path_segments()
                    .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| host.to_string());
        Ok(Self {
            platform: Platform::Tiktok,
            id,
            source_url: url.to_string(),
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Video id, or the short-link code for TikTok URLs that carry no id yet.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn default_title(&self) -> String {
        match self.platform {
            Platform::Youtube => format!("video_{}", self.id),
            Platform::Tiktok => format!("tiktok_{}", self.id),
        }
    }
}

impl fmt::Display for VideoIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform.as_str(), self.id)
    }
}

pub fn is_valid_youtube_id(raw: &str) -> bool {
    raw.len() == YOUTUBE_ID_LEN
        && raw
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

pub fn is_tiktok_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "tiktok.com" || host.ends_with(".tiktok.com")
}

/// Digits following `/video/` in a canonical TikTok path.
pub fn tiktok_video_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    segments.find(|segment| *segment == "video")?;
    segments
        .next()
        .filter(|id| !id.is_empty() && id.chars().all(|ch| ch.is_ascii_digit()))
        .map(str::to_string)
}

/// Ceiling for the video height; never an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    P360,
    P480,
    #[default]
    P720,
    P1080,
}

impl Quality {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "360p" | "360" => Some(Self::P360),
            "480p" | "480" => Some(Self::P480),
            "720p" | "720" => Some(Self::P720),
            "1080p" | "1080" => Some(Self::P1080),
            _ => None,
        }
    }

    pub fn max_height(self) -> u32 {
        match self {
            Self::P360 => 360,
            Self::P480 => 480,
            Self::P720 => 720,
            Self::P1080 => 1080,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P360 => "360p",
            Self::P480 => "480p",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaFormat {
    #[default]
    Mp4,
    Mp3,
}

impl MediaFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
        }
    }

    pub fn content_type(self) -> String {
        mime_guess::from_ext(self.extension())
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Mp3)
    }
}

/// One acquisition, built per HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub identifier: VideoIdentifier,
    pub quality: Quality,
    pub format: MediaFormat,
    pub watermark_free: bool,
}

impl DownloadRequest {
    pub fn new(identifier: VideoIdentifier) -> Self {
        Self {
            identifier,
            quality: Quality::default(),
            format: MediaFormat::default(),
            watermark_free: false,
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_format(mut self, format: MediaFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_watermark_free(mut self, watermark_free: bool) -> Self {
        self.watermark_free = watermark_free;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngagementStats {
    pub likes: u64,
    pub shares: u64,
    pub comments: u64,
    pub plays: u64,
}

/// Fields lifted from a rendered TikTok page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedVideoRecord {
    pub platform_video_id: String,
    pub description: String,
    pub author: Option<String>,
    pub stats: EngagementStats,
    pub play_address: Option<String>,
    pub download_address: Option<String>,
    pub cover_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub session_cookie: Option<String>,
}

impl ScrapedVideoRecord {
    /// `playAddr` usually carries no watermark, `downloadAddr` usually does.
    pub fn media_url(&self, watermark_free: bool) -> Option<&str> {
        let (preferred, fallback) = if watermark_free {
            (&self.play_address, &self.download_address)
        } else {
            (&self.download_address, &self.play_address)
        };
        preferred.as_deref().or(fallback.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn youtube_ids_must_be_eleven_safe_chars() {
        assert!(VideoIdentifier::youtube("dQw4w9WgXcQ").is_ok());
        assert!(VideoIdentifier::youtube("a-b_c-d_e-f").is_ok());
        for bad in [
            "",
            "dQw4w9WgXc",
            "dQw4w9WgXcQQ",
            "dQw4w9WgXc!",
            "dQw4w9WgXc ",
            "../../etc/pw",
        ] {
            let err = VideoIdentifier::youtube(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InputValidationError, "{bad:?}");
        }
    }

    #[test]
    fn youtube_identifier_builds_watch_url_and_title() {
        let id = VideoIdentifier::youtube("dQw4w9WgXcQ").unwrap();
        assert_eq!(id.source_url(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(id.default_title(), "video_dQw4w9WgXcQ");
        assert_eq!(id.platform(), Platform::Youtube);
    }

    #[test]
    fn tiktok_identifier_requires_a_tiktok_url() {
        let id =
            VideoIdentifier::tiktok("https://www.tiktok.com/@someone/video/7234567890123456789")
                .unwrap();
        assert_eq!(id.id(), "7234567890123456789");
        assert_eq!(id.default_title(), "tiktok_7234567890123456789");

        let short = VideoIdentifier::tiktok("https://vm.tiktok.com/ZMabc123/").unwrap();
        assert_eq!(short.id(), "ZMabc123");

        for bad in [
            "7234567890123456789",
            "not a url",
            "ftp://www.tiktok.com/@a/video/1",
            "https://example.com/@a/video/1",
            "https://nottiktok.com/@a/video/1",
        ] {
            let err = VideoIdentifier::tiktok(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InputValidationError, "{bad:?}");
        }
    }

    #[test]
    fn quality_parses_known_ceilings() {
        assert_eq!(Quality::parse("1080p"), Some(Quality::P1080));
        assert_eq!(Quality::parse(" 480P "), Some(Quality::P480));
        assert_eq!(Quality::parse("4k"), None);
        assert_eq!(Quality::default().max_height(), 720);
    }

    #[test]
    fn formats_map_to_content_types() {
        assert_eq!(MediaFormat::Mp4.content_type(), "video/mp4");
        assert_eq!(MediaFormat::Mp3.content_type(), "audio/mpeg");
        assert_eq!(MediaFormat::parse("MP3"), Some(MediaFormat::Mp3));
        assert_eq!(MediaFormat::parse("webm"), None);
    }

    #[test]
    fn watermark_preference_picks_play_address() {
        let record = ScrapedVideoRecord {
            play_address: Some("https://cdn/play".into()),
            download_address: Some("https://cdn/download".into()),
            ..ScrapedVideoRecord::default()
        };
        assert_eq!(record.media_url(true), Some("https://cdn/play"));
        assert_eq!(record.media_url(false), Some("https://cdn/download"));

        let only_download = ScrapedVideoRecord {
            download_address: Some("https://cdn/download".into()),
            ..ScrapedVideoRecord::default()
        };
        assert_eq!(only_download.media_url(true), Some("https://cdn/download"));
    }
}
