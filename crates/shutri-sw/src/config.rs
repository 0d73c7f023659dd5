//! Worker configuration.
//!
//! The current bucket name lives here instead of in a module constant so a
//! version bump is just a different config value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Bucket name prefix for the Sruti Gita page.
pub const DEFAULT_CACHE_PREFIX: &str = "sruti-gita";

/// Current deployed cache version.
pub const DEFAULT_CACHE_VERSION: u32 = 1;

/// Where the background tracks are served from.
const AUDIO_BASE: &str = "https://raw.githubusercontent.com/ashutoshmjain/shutri/main/audio";

/// Number of background tracks (`bg01.mp3` ..= `bg09.mp3`).
const AUDIO_TRACKS: u32 = 9;

/// How fetch events are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategy {
    /// Answer from cache when present, else network. Never updates the cache.
    #[default]
    CacheFirst,
    /// Answer from cache immediately and refresh the entry from network.
    StaleWhileRevalidate,
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStrategy::CacheFirst => f.write_str("cache-first"),
            FetchStrategy::StaleWhileRevalidate => f.write_str("stale-while-revalidate"),
        }
    }
}

impl FromStr for FetchStrategy {
    type Err = ServiceWorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache-first" => Ok(Self::CacheFirst),
            "stale-while-revalidate" | "swr" => Ok(Self::StaleWhileRevalidate),
            other => Err(ServiceWorkerError::Config(format!(
                "unknown fetch strategy: {other}"
            ))),
        }
    }
}

/// Offline asset cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name of the current bucket. Every other bucket is purged on activate.
    pub cache_name: String,

    /// Origin that local manifest paths resolve against.
    pub origin: Url,

    /// Assets fetched and stored at install, in order.
    pub manifest: Vec<String>,

    /// Fetch strategy for this version.
    pub strategy: FetchStrategy,

    /// Activate as soon as install succeeds.
    pub skip_waiting: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut manifest = vec!["/".to_string(), "/index.html".to_string()];
        manifest.extend((1..=AUDIO_TRACKS).map(|n| format!("{AUDIO_BASE}/bg{n:02}.mp3")));

        Self {
            cache_name: cache_name(DEFAULT_CACHE_PREFIX, DEFAULT_CACHE_VERSION),
            origin: Url::parse("http://localhost:8000/").expect("static origin parses"),
            manifest,
            strategy: FetchStrategy::default(),
            skip_waiting: true,
        }
    }
}

impl WorkerConfig {
    /// Default configuration with the bucket named `<prefix>-v<version>`.
    pub fn versioned(prefix: &str, version: u32) -> Self {
        Self {
            cache_name: cache_name(prefix, version),
            ..Default::default()
        }
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_manifest<I, S>(mut self, manifest: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = manifest.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: FetchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    /// Resolve every manifest entry against the origin.
    pub fn resolved_manifest(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        if self.cache_name.is_empty() {
            return Err(ServiceWorkerError::Config("cache name is empty".into()));
        }
        self.manifest
            .iter()
            .map(|entry| {
                self.origin.join(entry).map_err(|e| {
                    ServiceWorkerError::Config(format!("manifest entry {entry:?}: {e}"))
                })
            })
            .collect()
    }
}

fn cache_name(prefix: &str, version: u32) -> String {
    format!("{prefix}-v{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let config = WorkerConfig::default();
        assert_eq!(config.cache_name, "sruti-gita-v1");
        assert_eq!(config.manifest.len(), 11);
        assert_eq!(config.manifest[0], "/");
        assert_eq!(config.manifest[1], "/index.html");
        assert_eq!(
            config.manifest[10],
            "https://raw.githubusercontent.com/ashutoshmjain/shutri/main/audio/bg09.mp3"
        );
        assert_eq!(config.strategy, FetchStrategy::CacheFirst);
        assert!(config.skip_waiting);
    }

    #[test]
    fn test_versioned_name() {
        assert_eq!(WorkerConfig::versioned("sruti-gita", 2).cache_name, "sruti-gita-v2");
    }

    #[test]
    fn test_resolved_manifest_mixes_local_and_remote() {
        let config = WorkerConfig::default()
            .with_origin(Url::parse("https://gita.example/app/").unwrap())
            .with_manifest(["/", "index.html", "https://cdn.example/bg01.mp3"]);

        let urls: Vec<String> = config
            .resolved_manifest()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://gita.example/",
                "https://gita.example/app/index.html",
                "https://cdn.example/bg01.mp3",
            ]
        );
    }

    #[test]
    fn test_resolved_manifest_rejects_empty_name() {
        let mut config = WorkerConfig::default();
        config.cache_name.clear();
        assert!(matches!(
            config.resolved_manifest(),
            Err(ServiceWorkerError::Config(_))
        ));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WorkerConfig::from_json(
            r#"{ "cache_name": "sruti-gita-v7", "strategy": "stale-while-revalidate" }"#,
        )
        .unwrap();
        assert_eq!(config.cache_name, "sruti-gita-v7");
        assert_eq!(config.strategy, FetchStrategy::StaleWhileRevalidate);
        assert_eq!(config.manifest, WorkerConfig::default().manifest);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(WorkerConfig::from_json("{ nope").is_err());
    }

    #[test]
    fn test_strategy_parse_and_display() {
        for strategy in [FetchStrategy::CacheFirst, FetchStrategy::StaleWhileRevalidate] {
            assert_eq!(strategy.to_string().parse::<FetchStrategy>().unwrap(), strategy);
        }
        assert_eq!(
            "swr".parse::<FetchStrategy>().unwrap(),
            FetchStrategy::StaleWhileRevalidate
        );
        assert!("network-first".parse::<FetchStrategy>().is_err());
    }
}
