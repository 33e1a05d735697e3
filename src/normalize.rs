//! Classifiers that turn raw upstream signals into [`UpstreamError`]s.
//!
//! Every function here is pure: given the same status, body or stderr text it
//! produces the same classification, which keeps the fallback decisions in the
//! orchestrator predictable and testable without any network.

use axum::http::StatusCode;
use serde::Deserialize;

use crate::error::{ErrorKind, UpstreamError};

const MAX_DETAIL_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorPayload,
}

#[derive(Debug, Deserialize)]
struct ApiErrorPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ApiErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEntry {
    #[serde(default)]
    reason: Option<String>,
}

/// Maps a non-2xx response of the YouTube Data API.
pub fn classify_api_error(status: StatusCode, body: &str) -> UpstreamError {
    let payload = serde_json::from_str::<ApiErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error);
    let upstream_message = payload
        .as_ref()
        .and_then(|payload| payload.message.clone())
        .unwrap_or_default();
    let reason = payload
        .as_ref()
        .and_then(|payload| payload.errors.iter().find_map(|entry| entry.reason.clone()));

    let classified = match reason.as_deref() {
        Some("quotaExceeded" | "dailyLimitExceeded" | "rateLimitExceeded") => Some(
            UpstreamError::auth(
                "The YouTube API quota has been exhausted. Please try again later.",
            )
            .with_status(StatusCode::FORBIDDEN),
        ),
        Some("keyInvalid" | "keyExpired") => Some(invalid_credentials()),
        Some("badRequest") if upstream_message.contains("API key") => Some(invalid_credentials()),
        Some("forbidden") => Some(UpstreamError::blocked(
            "Access to this video was refused. The video may be private.",
        )),
        Some("notFound" | "videoNotFound") => Some(video_not_found()),
        _ => None,
    };

    let err = classified.unwrap_or_else(|| match status.as_u16() {
        401 | 403 => UpstreamError::auth(
            "The YouTube API rejected the request. Check the configured credentials.",
        )
        .with_status(status),
        404 => video_not_found(),
        500..=599 => UpstreamError::network(
            "The YouTube API is temporarily unavailable. Try again later.",
        ),
        _ => UpstreamError::internal(format!(
            "The YouTube API returned an unexpected status {status}."
        )),
    });

    let err = match reason {
        Some(reason) => err.with_reason(reason),
        None => err,
    };
    err.with_details(truncate_details(&upstream_message))
}

/// Maps a reqwest failure that never produced a usable response.
pub fn classify_transport(err: &reqwest::Error, operation: &str) -> UpstreamError {
    if err.is_timeout() {
        return UpstreamError::timeout(operation).with_details(err.to_string());
    }
    if err.is_connect() {
        return UpstreamError::network(format!(
            "{operation} could not reach the upstream host. Try again later."
        ))
        .with_reason("connect")
        .with_details(err.to_string());
    }
    if err.is_request() || err.is_body() {
        return UpstreamError::network(format!(
            "{operation} was interrupted before completing. Try again later."
        ))
        .with_details(err.to_string());
    }
    UpstreamError::internal(format!("{operation} failed unexpectedly."))
        .with_details(err.to_string())
}

/// Maps the diagnostic text of a failed download attempt.
///
/// Used for `yt-dlp` stderr and for the native player's playability reason.
pub fn classify_downloader_output(output: &str, exit_code: Option<i32>) -> UpstreamError {
    let lower = output.to_ascii_lowercase();
    let details = diagnostic_line(output);
    let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    let err = if has(&[
        "private video",
        "video is private",
        "confirm your age",
        "age-restricted",
        "age restricted",
        "inappropriate for some users",
        "members-only",
        "members only",
        "join this channel",
        "drm protected",
        "drm-protected",
        "this video is drm",
    ]) {
        UpstreamError::blocked(
            "This video is private, age-restricted or members-only and cannot be downloaded.",
        )
        .with_reason("restricted")
        .into_terminal()
    } else if has(&[
        "video unavailable",
        "has been removed",
        "does not exist",
        "no longer available",
        "account associated with this video has been terminated",
        "http error 404",
    ]) {
        UpstreamError::not_found(
            "This video is unavailable. It may have been deleted by the uploader.",
        )
        .with_reason("unavailable")
        .into_terminal()
    } else if has(&[
        "http error 429",
        "too many requests",
        "not a bot",
        "bot check",
        "http error 403",
        "forbidden",
    ]) {
        UpstreamError::blocked(
            "The platform is refusing requests from this server. Try again later.",
        )
        .with_reason("rateLimited")
    } else if has(&[
        "unable to extract",
        "nsig extraction failed",
        "signature extraction failed",
        "requested format is not available",
        "unsupported url",
        "no video formats found",
        "failed to parse",
    ]) {
        UpstreamError::extraction(
            "The downloader could not extract this video. Its extractor likely needs updating.",
        )
        .with_reason("extractorOutdated")
    } else if has(&[
        "timed out",
        "timeout",
        "connection refused",
        "connection reset",
        "name resolution",
        "getaddrinfo",
        "network is unreachable",
        "unable to download webpage",
    ]) {
        UpstreamError::network("Network error while contacting the platform. Try again later.")
            .with_reason("network")
    } else if exit_code == Some(0) {
        UpstreamError::extraction("The downloader finished without producing any media.")
            .with_reason("emptyOutput")
    } else {
        let reason = exit_code
            .map(|code| format!("exit:{code}"))
            .unwrap_or_else(|| "signal".to_string());
        UpstreamError::internal("The downloader failed unexpectedly.").with_reason(reason)
    };

    err.with_details(details)
}

/// Maps a non-OK `playabilityStatus` of the InnerTube player endpoint.
pub fn classify_playability(status: &str, reason: Option<&str>) -> UpstreamError {
    let text = reason.unwrap_or_default();
    let classified = classify_downloader_output(text, None);
    if classified.kind() != ErrorKind::InternalError {
        return classified;
    }
    match status {
        "LOGIN_REQUIRED" | "UNPLAYABLE" | "AGE_CHECK_REQUIRED" => UpstreamError::blocked(
            "This video requires sign-in or is restricted and cannot be downloaded.",
        )
        .with_reason(status)
        .with_details(text)
        .into_terminal(),
        "ERROR" => UpstreamError::not_found(
            "This video is unavailable. It may have been deleted by the uploader.",
        )
        .with_reason(status)
        .with_details(text)
        .into_terminal(),
        _ => classified.with_reason(status),
    }
}

/// Maps a failure of the headless browser session.
pub fn classify_browser_failure(stage: &str, message: &str) -> UpstreamError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        return UpstreamError::timeout("TikTok page load").with_details(truncate_details(message));
    }
    if lower.contains("net::err_") {
        return UpstreamError::network(
            "The TikTok page could not be loaded. Try again later.",
        )
        .with_reason("navigation")
        .with_details(truncate_details(message));
    }
    UpstreamError::internal(format!("Headless browser failed while {stage}."))
        .with_details(truncate_details(message))
}

/// Maps a non-2xx status returned by a media CDN.
pub fn classify_media_status(status: StatusCode) -> UpstreamError {
    let err = match status.as_u16() {
        403 | 429 => UpstreamError::blocked(
            "The media host refused the download. Try again later.",
        ),
        404 | 410 => UpstreamError::not_found("The media file is no longer available."),
        _ => UpstreamError::network(format!(
            "The media host answered with status {status}. Try again later."
        )),
    };
    err.with_reason(status.as_u16().to_string())
}

fn invalid_credentials() -> UpstreamError {
    UpstreamError::auth(
        "The YouTube API key is invalid or expired (invalid credentials). Check the server configuration.",
    )
}

fn video_not_found() -> UpstreamError {
    UpstreamError::not_found("Video not found. It may have been deleted or made unavailable.")
}

/// Last `ERROR:` line of a diagnostic dump, or its last non-empty line.
fn diagnostic_line(output: &str) -> String {
    let line = output
        .lines()
        .rev()
        .find(|line| line.contains("ERROR"))
        .or_else(|| output.lines().rev().find(|line| !line.trim().is_empty()))
        .unwrap_or_default();
    truncate_details(line.trim())
}

fn truncate_details(text: &str) -> String {
    text.chars().take(MAX_DETAIL_CHARS).collect()
}
