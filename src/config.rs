#![forbid(unsafe_code)]

//! Runtime configuration, sourced from environment variables.
//!
//! Every knob has a default so the service comes up with nothing set; the
//! proxy and PO-token strategies simply stay disabled until `PROXY_URL` /
//! `POT_PROVIDER_URL` appear.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_SEARCH_CACHE_TTL_SECS: u64 = 3600;
pub const DEFAULT_BYTE_CACHE_MB: usize = 100;
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// TTL applied to cached search responses.
    pub search_cache_ttl: Duration,
    /// Total byte-cache budget in bytes.
    pub byte_cache_max_bytes: usize,
    /// Egress proxy for the proxied-IP resolve strategy and for streaming
    /// URLs that were resolved through it.
    pub proxy_url: Option<String>,
    /// External Proof-of-Origin token provider.
    pub pot_provider_url: Option<String>,
    /// Raw Netscape-format cookies, written to disk once at startup.
    pub cookies: Option<String>,
    /// Resolver binary; overridable so tests can point at a stub.
    pub ytdlp_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(env_var_string)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let search_cache_ttl = lookup("YOUTUBE_API_CACHE_TTL")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_SEARCH_CACHE_TTL_SECS));
        let byte_cache_max_bytes = lookup("VIDEO_CACHE_SIZE_MB")
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|mb| *mb > 0)
            .unwrap_or(DEFAULT_BYTE_CACHE_MB)
            * 1024
            * 1024;
        let ytdlp_path = lookup("YTDLP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

        Self {
            port,
            search_cache_ttl,
            byte_cache_max_bytes,
            proxy_url: lookup("PROXY_URL"),
            pot_provider_url: lookup("POT_PROVIDER_URL"),
            cookies: lookup("YOUTUBE_COOKIES"),
            ytdlp_path,
        }
    }

    /// Local `/pot` endpoint handed to the resolver subprocess so its token
    /// fetches go through our cache instead of hammering the provider.
    /// `None` when no provider is configured.
    pub fn pot_endpoint(&self) -> Option<String> {
        self.pot_provider_url
            .as_ref()
            .map(|_| format!("http://127.0.0.1:{}/pot", self.port))
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_with_empty_environment() {
        let config = config_from(&[]);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.search_cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.byte_cache_max_bytes, 100 * 1024 * 1024);
        assert_eq!(config.ytdlp_path, PathBuf::from("yt-dlp"));
        assert!(config.proxy_url.is_none());
        assert!(config.pot_provider_url.is_none());
        assert!(config.pot_endpoint().is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = config_from(&[
            ("PORT", "9100"),
            ("YOUTUBE_API_CACHE_TTL", "120"),
            ("VIDEO_CACHE_SIZE_MB", "10"),
            ("PROXY_URL", "http://proxy.internal:3128"),
            ("POT_PROVIDER_URL", "http://pot.internal:4416"),
            ("YTDLP_PATH", "/opt/bin/yt-dlp"),
        ]);
        assert_eq!(config.port, 9100);
        assert_eq!(config.search_cache_ttl, Duration::from_secs(120));
        assert_eq!(config.byte_cache_max_bytes, 10 * 1024 * 1024);
        assert_eq!(
            config.proxy_url.as_deref(),
            Some("http://proxy.internal:3128")
        );
        assert_eq!(config.ytdlp_path, PathBuf::from("/opt/bin/yt-dlp"));
    }

    #[test]
    fn unparseable_values_fall_back() {
        let config = config_from(&[
            ("PORT", "not-a-port"),
            ("YOUTUBE_API_CACHE_TTL", "0"),
            ("VIDEO_CACHE_SIZE_MB", "-5"),
        ]);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.search_cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.byte_cache_max_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn pot_endpoint_points_at_local_port() {
        let config = config_from(&[
            ("PORT", "8099"),
            ("POT_PROVIDER_URL", "http://pot.internal:4416"),
        ]);
        assert_eq!(
            config.pot_endpoint().as_deref(),
            Some("http://127.0.0.1:8099/pot")
        );
    }
}
