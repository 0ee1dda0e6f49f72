//! Configuration types.
//!
//! Precedence, highest first: per-request override, environment, JSON config
//! file, built-in default. Everything is resolved once per request into
//! immutable values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::Platform;

/// Attachment handling settings in effect for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSettings {
    /// When false, no attachment is probed or downloaded.
    pub enabled: bool,
    /// Maximum attachment size; `0` means unlimited.
    pub max_size_bytes: u64,
    /// Accepted MIME types; empty means any.
    pub allowed_mime_types: Vec<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size_bytes: 0,
            allowed_mime_types: Vec::new(),
        }
    }
}

impl ImageSettings {
    /// Merge a per-request override onto these settings, producing new settings.
    pub fn with_override(&self, overrides: &ImageSettingsOverride) -> Self {
        Self {
            enabled: overrides.enabled.unwrap_or(self.enabled),
            max_size_bytes: overrides.max_size_bytes.unwrap_or(self.max_size_bytes),
            allowed_mime_types: overrides
                .allowed_mime_types
                .clone()
                .unwrap_or_else(|| self.allowed_mime_types.clone()),
        }
    }

    pub fn mime_allowed(&self, mime: &str) -> bool {
        self.allowed_mime_types.is_empty()
            || self
                .allowed_mime_types
                .iter()
                .any(|m| m.eq_ignore_ascii_case(mime))
    }

    pub fn size_allowed(&self, size: u64) -> bool {
        self.max_size_bytes == 0 || size <= self.max_size_bytes
    }
}

/// Per-request attachment overrides. `None` keeps the global value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageSettingsOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
    #[serde(default)]
    pub allowed_mime_types: Option<Vec<String>>,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Retrieval pipeline configuration.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Maximum days per fetch chunk.
    pub chunk_size_days: u32,
    /// Fetch gate size.
    pub max_concurrent_fetches: usize,
    /// Download gate size, independent of the fetch gate.
    pub max_concurrent_downloads: usize,
    /// Root directory of the daily message cache.
    pub cache_dir: PathBuf,
    pub retry: RetryPolicy,
    /// Global attachment defaults.
    pub images: ImageSettings,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size_days: 7,
            max_concurrent_fetches: 5,
            max_concurrent_downloads: 5,
            cache_dir: PathBuf::from("./cache"),
            retry: RetryPolicy::default(),
            images: ImageSettings::default(),
        }
    }
}

/// One platform section of the JSON config file.
#[derive(Debug, Default, Deserialize)]
struct PlatformSection {
    parallel_fetch_chunk_days: Option<u32>,
    max_concurrent_fetches: Option<usize>,
    max_concurrent_media_downloads: Option<usize>,
    cache_dir: Option<PathBuf>,
    image_processing: Option<ImageSettingsOverride>,
}

impl RetrievalConfig {
    /// Apply environment overrides on top of `self`.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_parse::<u32>("CHAT_HARVEST_CHUNK_SIZE_DAYS")? {
            self.chunk_size_days = v;
        }
        if let Some(v) = env_parse::<usize>("CHAT_HARVEST_MAX_CONCURRENT_FETCHES")? {
            self.max_concurrent_fetches = v;
        }
        if let Some(v) = env_parse::<usize>("CHAT_HARVEST_MAX_CONCURRENT_DOWNLOADS")? {
            self.max_concurrent_downloads = v;
        }
        if let Some(v) = env_parse::<u64>("CHAT_HARVEST_MAX_ATTACHMENT_SIZE_BYTES")? {
            self.images.max_size_bytes = v;
        }
        if let Some(v) = env_parse::<bool>("CHAT_HARVEST_IMAGES_ENABLED")? {
            self.images.enabled = v;
        }
        if let Ok(raw) = std::env::var("CHAT_HARVEST_ALLOWED_MIME_TYPES") {
            self.images.allowed_mime_types = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(dir) = std::env::var("CHAT_HARVEST_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        self.validate()?;
        Ok(self)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Load the `platform` section of a JSON config file.
    ///
    /// A missing section yields the defaults.
    pub fn from_json_file(path: &Path, platform: Platform) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw, platform)
    }

    pub fn from_json_str(raw: &str, platform: Platform) -> Result<Self, ConfigError> {
        let root: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let section: PlatformSection = match root.get(platform.as_str()) {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ConfigError::ParseError(format!("[{platform}] {e}")))?,
            None => PlatformSection::default(),
        };

        let mut config = Self::default();
        if let Some(v) = section.parallel_fetch_chunk_days {
            config.chunk_size_days = v;
        }
        if let Some(v) = section.max_concurrent_fetches {
            config.max_concurrent_fetches = v;
        }
        if let Some(v) = section.max_concurrent_media_downloads {
            config.max_concurrent_downloads = v;
        }
        if let Some(dir) = section.cache_dir {
            config.cache_dir = dir;
        }
        if let Some(images) = section.image_processing {
            config.images = config.images.with_override(&images);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("chunk_size_days", self.chunk_size_days as usize),
            ("max_concurrent_fetches", self.max_concurrent_fetches),
            ("max_concurrent_downloads", self.max_concurrent_downloads),
            ("retry.max_attempts", self.retry.max_attempts as usize),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
