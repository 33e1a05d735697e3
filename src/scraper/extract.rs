//! Pulls the video record out of the state blobs TikTok embeds in its pages.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::{
    error::UpstreamError,
    model::{EngagementStats, ScrapedVideoRecord},
};

static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<script\b[^>]*?\bid="([^"]+)"[^>]*>(.*?)</script>"#).unwrap()
});

/// Known page layouts, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    UniversalData,
    SigiState,
    NextData,
}

impl ExtractionStrategy {
    pub const ORDERED: [Self; 3] = [Self::UniversalData, Self::SigiState, Self::NextData];

    pub fn script_id(self) -> &'static str {
        match self {
            Self::UniversalData => "__UNIVERSAL_DATA_FOR_REHYDRATION__",
            Self::SigiState => "SIGI_STATE",
            Self::NextData => "__NEXT_DATA__",
        }
    }

    fn locate_item(self, blob: &Value) -> Option<&Value> {
        match self {
            Self::UniversalData => blob
                .get("__DEFAULT_SCOPE__")?
                .get("webapp.video-detail")?
                .get("itemInfo")?
                .get("itemStruct"),
            Self::SigiState => blob.get("ItemModule")?.as_object()?.values().next(),
            Self::NextData => blob
                .get("props")?
                .get("pageProps")?
                .get("itemInfo")?
                .get("itemStruct"),
        }
    }
}

/// Tries each strategy in order and returns the first complete record.
pub fn extract_record(html: &str) -> Result<ScrapedVideoRecord, UpstreamError> {
    let mut saw_state = false;
    for strategy in ExtractionStrategy::ORDERED {
        let Some(blob) = script_json(html, strategy.script_id()) else {
            continue;
        };
        saw_state = true;
        match strategy.locate_item(&blob).and_then(record_from_item) {
            Some(record) => {
                debug!(?strategy, video_id = %record.platform_video_id, "extracted TikTok record");
                return Ok(record);
            }
            None => debug!(?strategy, "state blob present but video fields missing"),
        }
    }

    let message = if saw_state {
        "The TikTok page state no longer contains the expected video fields; the extraction likely needs updating."
    } else {
        "The TikTok page carried no embedded video state; the extraction likely needs updating."
    };
    Err(UpstreamError::extraction(message).with_reason("pageStructure"))
}

fn script_json(html: &str, id: &str) -> Option<Value> {
    SCRIPT_RE
        .captures_iter(html)
        .find(|captures| &captures[1] == id)
        .and_then(|captures| serde_json::from_str(captures[2].trim()).ok())
}

fn record_from_item(item: &Value) -> Option<ScrapedVideoRecord> {
    let id = text_or_number(item.get("id")?)?;
    let video = item.get("video")?;
    let play_address = non_empty_str(video.get("playAddr"));
    let download_address = non_empty_str(video.get("downloadAddr"));
    if play_address.is_none() && download_address.is_none() {
        return None;
    }

    let author = match item.get("author") {
        Some(Value::String(name)) if !name.is_empty() => Some(name.clone()),
        Some(author) => non_empty_str(author.get("uniqueId"))
            .or_else(|| non_empty_str(author.get("nickname"))),
        None => None,
    };
    let stats = item
        .get("stats")
        .or_else(|| item.get("statsV2"))
        .map(|stats| EngagementStats {
            likes: count(stats.get("diggCount")),
            shares: count(stats.get("shareCount")),
            comments: count(stats.get("commentCount")),
            plays: count(stats.get("playCount")),
        })
        .unwrap_or_default();
    let cover_url = non_empty_str(video.get("cover"))
        .or_else(|| non_empty_str(video.get("originCover")))
        .or_else(|| non_empty_str(video.get("dynamicCover")));
    let created_at = item
        .get("createTime")
        .and_then(|value| match value {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.parse().ok(),
            _ => None,
        })
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0));

    Some(ScrapedVideoRecord {
        platform_video_id: id,
        description: item
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        author,
        stats,
        play_address,
        download_address,
        cover_url,
        created_at,
        session_cookie: None,
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn text_or_number(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Counters show up as numbers in `stats` and as strings in `statsV2`.
fn count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(number)) => number.as_u64().unwrap_or_default(),
        Some(Value::String(text)) => text.parse().unwrap_or_default(),
        _ => 0,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    pub(crate) fn item_struct(play: Option<&str>, download: Option<&str>) -> Value {
        json!({
            "id": "7234567890123456789",
            "desc": "dance #fyp",
            "createTime": "1700000000",
            "author": { "uniqueId": "dancer", "nickname": "The Dancer" },
            "stats": { "diggCount": 120, "shareCount": 7, "commentCount": 33, "playCount": 4000 },
            "video": {
                "playAddr": play,
                "downloadAddr": download,
                "cover": "https://cdn.example/cover.jpg"
            }
        })
    }

    pub(crate) fn universal_page(item: Value) -> String {
        let blob = json!({
            "__DEFAULT_SCOPE__": {
                "webapp.video-detail": { "itemInfo": { "itemStruct": item } }
            }
        });
        format!(
            r#"<html><head><script id="__UNIVERSAL_DATA_FOR_REHYDRATION__" type="application/json">{blob}</script></head></html>"#
        )
    }

    #[test]
    fn universal_data_is_preferred() {
        let html = universal_page(item_struct(Some("https://cdn/play"), Some("https://cdn/dl")));
        let record = extract_record(&html).unwrap();
        assert_eq!(record.platform_video_id, "7234567890123456789");
        assert_eq!(record.description, "dance #fyp");
        assert_eq!(record.author.as_deref(), Some("dancer"));
        assert_eq!(record.stats.likes, 120);
        assert_eq!(record.stats.comments, 33);
        assert_eq!(record.play_address.as_deref(), Some("https://cdn/play"));
        assert_eq!(record.cover_url.as_deref(), Some("https://cdn.example/cover.jpg"));
        assert_eq!(record.created_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn falls_through_to_sigi_state() {
        let universal = json!({ "__DEFAULT_SCOPE__": { "webapp.app-context": {} } });
        let sigi = json!({
            "ItemModule": {
                "7234567890123456789": {
                    "id": "7234567890123456789",
                    "desc": "legacy",
                    "author": "olduser",
                    "statsV2": { "diggCount": "15", "shareCount": "2", "commentCount": "1", "playCount": "99" },
                    "video": { "downloadAddr": "https://cdn/legacy" }
                }
            }
        });
        let html = format!(
            r#"<script id="__UNIVERSAL_DATA_FOR_REHYDRATION__" type="application/json">{universal}</script>
<script id="SIGI_STATE" type="application/json">{sigi}</script>"#
        );
        let record = extract_record(&html).unwrap();
        assert_eq!(record.description, "legacy");
        assert_eq!(record.author.as_deref(), Some("olduser"));
        assert_eq!(record.stats.likes, 15);
        assert_eq!(record.media_url(true), Some("https://cdn/legacy"));
    }

    #[test]
    fn next_data_is_last_resort() {
        let next = json!({
            "props": { "pageProps": { "itemInfo": { "itemStruct": item_struct(None, Some("https://cdn/next")) } } }
        });
        let html = format!(r#"<script id="__NEXT_DATA__" type="application/json">{next}</script>"#);
        let record = extract_record(&html).unwrap();
        assert_eq!(record.download_address.as_deref(), Some("https://cdn/next"));
    }

    #[test]
    fn missing_state_reports_outdated_extraction() {
        let err = extract_record("<html><body>Please wait...</body></html>").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionError);
        assert!(err.message().contains("likely needs updating"));
    }

    #[test]
    fn item_without_media_addresses_is_rejected() {
        let err = extract_record(&universal_page(item_struct(None, None))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionError);
        assert!(err.message().contains("no longer contains"));
    }

    #[test]
    fn malformed_json_is_skipped() {
        let html = r#"<script id="__UNIVERSAL_DATA_FOR_REHYDRATION__">{not json</script>"#;
        let err = extract_record(html).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractionError);
    }
}
