//! Request-level entry point.
//!
//! [`MessageService`] resolves per-request settings (timezone, image
//! overrides, adapter), runs the fetch orchestrator under an optional timeout
//! and hands back a [`FetchReport`].

use std::time::Duration;

use chrono::NaiveDate;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::{ImageSettingsOverride, RetrievalConfig};
use crate::error::{FetchError, Result};
use crate::fetch::{FetchOrchestrator, FetchReport, FetchRequest};
use crate::model::{ConversationRef, Platform};
use crate::platforms::PlatformRegistry;
use crate::time::Timezone;

/// One caller request for a conversation's messages.
#[derive(Debug, Clone)]
pub struct GetMessagesRequest {
    pub platform: Platform,
    pub user: String,
    pub conversation: String,
    /// First calendar day, inclusive.
    pub start: NaiveDate,
    /// Last calendar day, inclusive.
    pub end: NaiveDate,
    /// `UTC`, `Z` or a fixed offset such as `+02:00`. Defaults to UTC.
    pub timezone: Option<String>,
    pub use_cache: bool,
    pub images: Option<ImageSettingsOverride>,
    pub timeout: Option<Duration>,
}

impl GetMessagesRequest {
    pub fn new(
        platform: Platform,
        user: impl Into<String>,
        conversation: impl Into<String>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Self {
        Self {
            platform,
            user: user.into(),
            conversation: conversation.into(),
            start,
            end,
            timezone: None,
            use_cache: true,
            images: None,
            timeout: None,
        }
    }

    pub fn conversation_ref(&self) -> ConversationRef {
        ConversationRef::new(self.platform, self.user.clone(), self.conversation.clone())
    }
}

/// Fetches messages for any registered platform.
pub struct MessageService {
    registry: PlatformRegistry,
    config: RetrievalConfig,
    cache: CacheStore,
}

impl MessageService {
    /// Build a service caching under `config.cache_dir`.
    pub fn new(registry: PlatformRegistry, config: RetrievalConfig) -> Self {
        let cache = CacheStore::new(config.cache_dir.clone());
        Self::with_cache(registry, config, cache)
    }

    pub fn with_cache(registry: PlatformRegistry, config: RetrievalConfig, cache: CacheStore) -> Self {
        Self {
            registry,
            config,
            cache,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    /// Retrieve, resolve and merge a conversation's messages for a date range.
    ///
    /// Partial results are returned as a report with `failed_ranges` set; use
    /// [`FetchReport::into_strict`] to treat them as errors.
    pub async fn get_messages(&self, request: GetMessagesRequest) -> std::result::Result<FetchReport, FetchError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "get_messages",
            %request_id,
            platform = %request.platform,
            conversation = %request.conversation,
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: GetMessagesRequest) -> std::result::Result<FetchReport, FetchError> {
        let adapter = self.registry.get(request.platform)?;
        let images = match &request.images {
            Some(overrides) => self.config.images.with_override(overrides),
            None => self.config.images.clone(),
        };
        let fetch = FetchRequest {
            conversation: request.conversation_ref(),
            start: request.start,
            end: request.end,
            timezone: Timezone::parse_or_utc(request.timezone.as_deref()),
            use_cache: request.use_cache,
        };
        tracing::info!(
            start = %fetch.start,
            end = %fetch.end,
            timezone = %fetch.timezone,
            use_cache = fetch.use_cache,
            images = images.enabled,
            "Fetching messages"
        );

        let orchestrator = FetchOrchestrator::new(adapter, self.cache.clone(), &self.config, images);
        match request.timeout {
            Some(after) => tokio::time::timeout(after, orchestrator.fetch_range(&fetch))
                .await
                .map_err(|_| {
                    tracing::warn!(after_ms = after.as_millis() as u64, "Fetch timed out");
                    FetchError::TimedOut { after }
                })?,
            None => orchestrator.fetch_range(&fetch).await,
        }
    }

    /// Drop every cached day of a conversation. Returns the number of entries
    /// removed.
    pub async fn invalidate_conversation(
        &self,
        platform: Platform,
        user: &str,
        conversation: &str,
    ) -> Result<usize> {
        let removed = self
            .cache
            .invalidate_conversation(&ConversationRef::new(platform, user, conversation))
            .await?;
        Ok(removed)
    }
}
