#![forbid(unsafe_code)]

//! Resolver orchestration around the external `yt-dlp` binary.
//!
//! A resolve picks between two strategies: the proxied-IP path (fast, format
//! pinned to known low-bitrate itags, URLs come back IP-locked to the proxy)
//! and the Proof-of-Origin-token path (slower, goes through the local `/pot`
//! cache, survives bot-detection challenges). With neither configured we
//! still try a bare invocation and accept that some videos fail.
//!
//! The subprocess contract is one URL per stdout line; the first non-empty
//! line wins. Spawns are gated by a two-permit semaphore so a burst of
//! distinct resolves cannot fork-bomb the host.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::cache::TtlCache;

/// Upper bound on resolver subprocesses alive at once, process-wide.
pub const MAX_CONCURRENT_RESOLVES: usize = 2;

/// Resolved-URL cache TTL when the stream URL carries no usable expiry.
pub const URL_CACHE_FALLBACK_TTL: Duration = Duration::from_secs(5 * 60);

/// Byte-cache TTL when the stream URL carries no usable expiry.
pub const BYTE_CACHE_FALLBACK_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Cached URLs are retired this long before the URL itself expires.
const EXPIRY_SAFETY_MS: i64 = 5 * 60 * 1000;

const PROXIED_TIMEOUT: Duration = Duration::from_secs(15);
const POT_TIMEOUT: Duration = Duration::from_secs(60);

pub fn is_valid_video_id(id: &str) -> bool {
    static VIDEO_ID: OnceLock<Regex> = OnceLock::new();
    VIDEO_ID
        .get_or_init(|| Regex::new("^[A-Za-z0-9_-]{11}$").unwrap())
        .is_match(id)
}

/// Cache key shared by the resolved-URL and byte caches.
pub fn cache_key(video_id: &str, video_only: bool) -> String {
    if video_only {
        format!("{video_id}:video")
    } else {
        video_id.to_string()
    }
}

/// A resolved stream URL plus everything a client needs to judge it.
///
/// `expires_at_ms` stays an explicit `null` in JSON when the URL carried no
/// `expire` parameter; clients distinguish "unknown" from "absent field".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedUrl {
    pub video_id: String,
    pub url: String,
    pub expires_at_ms: Option<i64>,
    pub resolved_at_ms: i64,
    pub video_only: bool,
    pub quality: String,
    /// The URL is IP-locked to the egress proxy; streaming it directly
    /// guarantees a 403.
    pub used_proxy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    ProxiedIp,
    PoToken,
    Bare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    BotDetection,
    Transient,
}

const BOT_DETECTION_MARKERS: &[&str] = &["sign in to confirm", "not a bot", "http error 403"];

fn classify_stderr(stderr: &str) -> FailureKind {
    let lowered = stderr.to_ascii_lowercase();
    if BOT_DETECTION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        FailureKind::BotDetection
    } else {
        FailureKind::Transient
    }
}

pub struct Resolver {
    bin: PathBuf,
    proxy_url: Option<String>,
    pot_endpoint: Option<String>,
    cookies_file: Option<PathBuf>,
    permits: Semaphore,
}

impl Resolver {
    pub fn new(
        bin: PathBuf,
        proxy_url: Option<String>,
        pot_endpoint: Option<String>,
        cookies_file: Option<PathBuf>,
    ) -> Self {
        Self {
            bin,
            proxy_url,
            pot_endpoint,
            cookies_file,
            permits: Semaphore::new(MAX_CONCURRENT_RESOLVES),
        }
    }

    /// Resolves a video ID to a playable stream URL.
    ///
    /// Proxy path first when configured; any proxy failure falls through to
    /// the PO-token path when that is configured. The caller is expected to
    /// have validated the ID and to wrap this call in singleflight.
    pub async fn resolve(&self, video_id: &str, video_only: bool) -> Result<ResolvedUrl> {
        let mut proxy_failure = None;

        if self.proxy_url.is_some() {
            match self.attempt(Strategy::ProxiedIp, video_id, video_only).await {
                Ok(resolved) => return Ok(resolved),
                Err(err) => {
                    warn!(video_id, "proxied resolve failed, falling back: {err:#}");
                    proxy_failure = Some(err);
                }
            }
        }

        if self.pot_endpoint.is_some() {
            return self.attempt(Strategy::PoToken, video_id, video_only).await;
        }

        match proxy_failure {
            Some(err) => Err(err),
            None => self.attempt(Strategy::Bare, video_id, video_only).await,
        }
    }

    async fn attempt(
        &self,
        strategy: Strategy,
        video_id: &str,
        video_only: bool,
    ) -> Result<ResolvedUrl> {
        let args = self.build_args(strategy, video_id, video_only);
        let deadline = match strategy {
            Strategy::ProxiedIp => PROXIED_TIMEOUT,
            Strategy::PoToken | Strategy::Bare => POT_TIMEOUT,
        };

        let url = self.run_resolver(&args, deadline, video_id).await?;
        Ok(ResolvedUrl {
            video_id: video_id.to_string(),
            quality: quality_label(&url, video_only),
            expires_at_ms: parse_expires_ms(&url),
            resolved_at_ms: Utc::now().timestamp_millis(),
            video_only,
            used_proxy: strategy == Strategy::ProxiedIp,
            url,
        })
    }

    fn build_args(&self, strategy: Strategy, video_id: &str, video_only: bool) -> Vec<String> {
        // Proxy egress is metered, so that path pins known low-bitrate itags
        // instead of letting the selector negotiate.
        let format = match (strategy, video_only) {
            (Strategy::ProxiedIp, false) => "18/160/133/134",
            (Strategy::ProxiedIp, true) => "160/133/134",
            (_, false) => "best[height<=360]/best",
            (_, true) => "bv[height<=360]/bv",
        };

        let mut args = vec![
            format!("https://www.youtube.com/watch?v={video_id}"),
            "-f".to_string(),
            format.to_string(),
            "-g".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--quiet".to_string(),
            "--no-cache-dir".to_string(),
        ];

        match strategy {
            Strategy::ProxiedIp => {
                if let Some(proxy) = &self.proxy_url {
                    args.push("--proxy".to_string());
                    args.push(proxy.clone());
                }
            }
            Strategy::PoToken => {
                if let Some(endpoint) = &self.pot_endpoint {
                    args.push("--js-runtimes".to_string());
                    args.push("node".to_string());
                    args.push("--remote-components".to_string());
                    args.push("ejs:github".to_string());
                    args.push("--extractor-args".to_string());
                    args.push(format!("youtubepot-bgutilhttp:base_url={endpoint}"));
                }
                self.push_cookies_arg(&mut args);
            }
            Strategy::Bare => {
                self.push_cookies_arg(&mut args);
            }
        }

        args
    }

    fn push_cookies_arg(&self, args: &mut Vec<String>) {
        if let Some(cookies) = &self.cookies_file
            && cookies.exists()
        {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
    }

    async fn run_resolver(
        &self,
        args: &[String],
        deadline: Duration,
        video_id: &str,
    ) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| anyhow!("resolver semaphore closed"))?;

        debug!(video_id, bin = %self.bin.display(), "spawning resolver");
        let mut command = Command::new(&self.bin);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(deadline, command.output())
            .await
            .map_err(|_| {
                anyhow!(
                    "resolver timed out after {}s for {video_id}",
                    deadline.as_secs()
                )
            })?
            .with_context(|| format!("launching {}", self.bin.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let kind = classify_stderr(&stderr);
            warn!(video_id, ?kind, "resolver failed: {}", stderr.trim());
            bail!("resolver exited with {} ({kind:?})", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| anyhow!("resolver produced no URL for {video_id}"))?;
        Ok(url.to_string())
    }
}

/// Maps the `itag` query parameter to a human resolution label and appends
/// the audio mode. Unknown itags are reported, not rejected.
pub fn quality_label(url: &str, video_only: bool) -> String {
    let resolution = itag_from_url(url)
        .and_then(resolution_for_itag)
        .unwrap_or("unknown");
    let mode = if video_only { "video-only" } else { "combined" };
    format!("{resolution} {mode}")
}

fn itag_from_url(url: &str) -> Option<u32> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "itag")
        .and_then(|(_, value)| value.parse().ok())
}

fn resolution_for_itag(itag: u32) -> Option<&'static str> {
    match itag {
        17 | 160 | 278 => Some("144p"),
        36 | 133 | 242 => Some("240p"),
        18 | 134 | 243 => Some("360p"),
        135 => Some("480p"),
        22 | 136 => Some("720p"),
        137 => Some("1080p"),
        _ => None,
    }
}

/// Reads the `expire` query parameter (unix seconds) as epoch milliseconds.
pub fn parse_expires_ms(url: &str) -> Option<i64> {
    let parsed = Url::parse(url).ok()?;
    let raw = parsed
        .query_pairs()
        .find(|(key, _)| key == "expire")
        .map(|(_, value)| value.into_owned())?;
    raw.parse::<i64>().ok().map(|seconds| seconds * 1000)
}

/// Cache TTL for a resolved URL: until five minutes before the URL's own
/// expiry when that leaves any runway, otherwise the caller's fallback.
pub fn derive_cache_ttl(expires_at_ms: Option<i64>, now_ms: i64, fallback: Duration) -> Duration {
    match expires_at_ms {
        Some(expiry) if expiry - now_ms > EXPIRY_SAFETY_MS => {
            Duration::from_millis((expiry - now_ms - EXPIRY_SAFETY_MS) as u64)
        }
        _ => fallback,
    }
}

/// Resolved-URL cache; `store` derives the TTL from the record itself.
pub struct UrlCache {
    entries: Arc<TtlCache<ResolvedUrl>>,
}

impl UrlCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(TtlCache::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<ResolvedUrl> {
        self.entries.get(key)
    }

    pub fn store(&self, key: &str, record: &ResolvedUrl) {
        let ttl = derive_cache_ttl(
            record.expires_at_ms,
            Utc::now().timestamp_millis(),
            URL_CACHE_FALLBACK_TTL,
        );
        self.entries.insert(key, record.clone(), ttl);
    }

    pub fn spawn_sweeper(&self, every: Duration) {
        self.entries.spawn_sweeper(every, "resolve");
    }
}

impl Default for UrlCache {
    fn default() -> Self {
        Self::new()
    }
}
