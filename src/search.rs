#![forbid(unsafe_code)]

//! Thin video-search backend over the public InnerTube API.
//!
//! One POST to `/youtubei/v1/search` with a WEB client context and the
//! videos-only filter, parsed leniently: anything that is not a recognizable
//! video renderer is skipped rather than failing the whole response.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

const SEARCH_URL: &str = "https://www.youtube.com/youtubei/v1/search?prettyPrint=false";
const WEB_CLIENT_VERSION: &str = "2.20250101.00.00";
/// InnerTube filter param restricting results to videos.
const VIDEOS_FILTER: &str = "EgIQAQ==";

/// One entry of a search response, shaped for clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoResult {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub channel_title: String,
    pub duration: String,
    pub is_live: bool,
    pub thumbnail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub items: Vec<VideoResult>,
    pub query: String,
    pub cached: bool,
    pub cache_at: i64,
}

/// Raw hit straight out of InnerTube, before response shaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub channel: String,
    /// Zero means live.
    pub duration_secs: u64,
    pub thumbnail: String,
}

impl SearchHit {
    pub fn into_result(self) -> VideoResult {
        VideoResult {
            id: self.id,
            kind: "video".to_string(),
            title: self.title,
            channel_title: self.channel,
            duration: format_duration(self.duration_secs),
            is_live: self.duration_secs == 0,
            thumbnail: self.thumbnail,
        }
    }
}

pub async fn video_search(client: &reqwest::Client, query: &str) -> Result<Vec<SearchHit>> {
    let body = json!({
        "context": {
            "client": {
                "clientName": "WEB",
                "clientVersion": WEB_CLIENT_VERSION,
                "hl": "en",
                "gl": "US",
            }
        },
        "query": query,
        "params": VIDEOS_FILTER,
    });

    let response = client
        .post(SEARCH_URL)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .context("sending search request")?;

    if !response.status().is_success() {
        bail!("search backend answered {}", response.status());
    }

    let payload: Value = response.json().await.context("decoding search response")?;
    let hits = extract_hits(&payload);
    debug!(query, hits = hits.len(), "search completed");
    Ok(hits)
}

/// Pulls video renderers out of an InnerTube search payload. Entries missing
/// an ID or title are skipped; a missing length text means a live stream.
fn extract_hits(payload: &Value) -> Vec<SearchHit> {
    let sections = payload["contents"]["twoColumnSearchResultsRenderer"]["primaryContents"]
        ["sectionListRenderer"]["contents"]
        .as_array();

    let mut hits = Vec::new();
    for section in sections.into_iter().flatten() {
        let Some(items) = section["itemSectionRenderer"]["contents"].as_array() else {
            continue;
        };
        for item in items {
            let renderer = &item["videoRenderer"];
            let Some(id) = renderer["videoId"].as_str() else {
                continue;
            };
            let Some(title) = renderer["title"]["runs"][0]["text"].as_str() else {
                continue;
            };
            let channel = renderer["ownerText"]["runs"][0]["text"]
                .as_str()
                .unwrap_or("");
            let duration_secs = renderer["lengthText"]["simpleText"]
                .as_str()
                .and_then(parse_length_text)
                .unwrap_or(0);
            let thumbnail = renderer["thumbnail"]["thumbnails"][0]["url"]
                .as_str()
                .unwrap_or("");

            hits.push(SearchHit {
                id: id.to_string(),
                title: title.to_string(),
                channel: channel.to_string(),
                duration_secs,
                thumbnail: thumbnail.to_string(),
            });
        }
    }
    hits
}

/// Renders seconds as `M:SS` or `H:MM:SS`; zero is a live stream.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "LIVE".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

/// Inverse of YouTube's length text, `1:01:05` style.
fn parse_length_text(text: &str) -> Option<u64> {
    let mut total = 0u64;
    for part in text.split(':') {
        let value = part.trim().parse::<u64>().ok()?;
        total = total * 60 + value;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(0), "LIVE");
        assert_eq!(format_duration(59), "0:59");
        assert_eq!(format_duration(61), "1:01");
        assert_eq!(format_duration(3661), "1:01:01");
        assert_eq!(format_duration(36_000), "10:00:00");
    }

    #[test]
    fn length_text_parsing() {
        assert_eq!(parse_length_text("0:59"), Some(59));
        assert_eq!(parse_length_text("1:01"), Some(61));
        assert_eq!(parse_length_text("1:01:05"), Some(3665));
        assert_eq!(parse_length_text("garbage"), None);
    }

    #[test]
    fn hit_maps_to_video_result() {
        let live = SearchHit {
            id: "dQw4w9WgXcQ".to_string(),
            title: "A stream".to_string(),
            channel: "Channel".to_string(),
            duration_secs: 0,
            thumbnail: "https://i.ytimg.com/t.jpg".to_string(),
        };
        let result = live.into_result();
        assert_eq!(result.kind, "video");
        assert!(result.is_live);
        assert_eq!(result.duration, "LIVE");
    }

    #[test]
    fn extract_hits_reads_video_renderers_and_skips_the_rest() {
        let payload = json!({
            "contents": {"twoColumnSearchResultsRenderer": {"primaryContents": {
                "sectionListRenderer": {"contents": [
                    {"itemSectionRenderer": {"contents": [
                        {"videoRenderer": {
                            "videoId": "dQw4w9WgXcQ",
                            "title": {"runs": [{"text": "Never Gonna Give You Up"}]},
                            "ownerText": {"runs": [{"text": "Rick Astley"}]},
                            "lengthText": {"simpleText": "3:33"},
                            "thumbnail": {"thumbnails": [{"url": "https://i.ytimg.com/a.jpg"}]},
                        }},
                        {"adSlotRenderer": {"whatever": true}},
                        {"videoRenderer": {
                            "videoId": "livestream1",
                            "title": {"runs": [{"text": "24/7 lofi"}]},
                            "ownerText": {"runs": [{"text": "Some Radio"}]},
                            "thumbnail": {"thumbnails": [{"url": "https://i.ytimg.com/b.jpg"}]},
                        }},
                    ]}},
                    {"continuationItemRenderer": {}},
                ]}
            }}}
        });

        let hits = extract_hits(&payload);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "dQw4w9WgXcQ");
        assert_eq!(hits[0].duration_secs, 213);
        assert_eq!(hits[0].channel, "Rick Astley");
        assert_eq!(hits[1].id, "livestream1");
        assert_eq!(hits[1].duration_secs, 0);
    }

    #[test]
    fn extract_hits_tolerates_unexpected_payloads() {
        assert!(extract_hits(&json!({})).is_empty());
        assert!(extract_hits(&json!({"contents": null})).is_empty());
    }
}
