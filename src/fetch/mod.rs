//! Fetch orchestration.
//!
//! A request's calendar days are split into cache hits and must-fetch days.
//! Must-fetch days are planned into chunks that run concurrently in a
//! [`JoinSet`], each holding a fetch-gate slot only while the adapter call is
//! in flight. Results are merged, deduplicated and re-linked across chunks.
//!
//! One chunk failing never aborts its siblings. Expired credentials do: they
//! would fail every other chunk too.

pub mod merge;
pub mod plan;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::attachments::{AttachmentPipeline, AttachmentStats};
use crate::cache::{CacheKey, CacheStore};
use crate::config::{ImageSettings, RetrievalConfig, RetryPolicy};
use crate::error::{AdapterError, FetchError};
use crate::gate::ConcurrencyGate;
use crate::model::{ConversationRef, FailedRange, FetchChunk, Message};
use crate::platforms::{PlatformAdapter, RawBatch};
use crate::retry::with_retry;
use crate::threads;
use crate::time::Timezone;

/// What to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub conversation: ConversationRef,
    /// First calendar day, inclusive.
    pub start: NaiveDate,
    /// Last calendar day, inclusive.
    pub end: NaiveDate,
    pub timezone: Timezone,
    pub use_cache: bool,
}

/// Outcome of a fetch. `failed_ranges` is non-empty for partial results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub messages: Vec<Message>,
    pub succeeded_ranges: Vec<FetchChunk>,
    pub failed_ranges: Vec<FailedRange>,
    /// Days served from the cache.
    pub cached_days: usize,
    #[serde(skip)]
    pub attachments: AttachmentStats,
}

impl FetchReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_ranges.is_empty()
    }

    /// Turn a partial report into [`FetchError::Partial`].
    pub fn into_strict(self) -> Result<Vec<Message>, FetchError> {
        if self.failed_ranges.is_empty() {
            Ok(self.messages)
        } else {
            Err(FetchError::Partial {
                succeeded_ranges: self.succeeded_ranges,
                failed_ranges: self.failed_ranges,
            })
        }
    }
}

/// Shared state of one request's chunk tasks.
struct ChunkContext {
    adapter: Arc<dyn PlatformAdapter>,
    fetch_gate: ConcurrencyGate,
    attachments: AttachmentPipeline,
    retry: RetryPolicy,
    conversation: ConversationRef,
    timezone: Timezone,
}

struct ChunkOutput {
    messages: Vec<Message>,
    attachments: AttachmentStats,
}

/// Runs one adapter's fetches under the fetch and download gates.
#[derive(Clone)]
pub struct FetchOrchestrator {
    adapter: Arc<dyn PlatformAdapter>,
    cache: CacheStore,
    fetch_gate: ConcurrencyGate,
    download_gate: ConcurrencyGate,
    images: ImageSettings,
    retry: RetryPolicy,
    chunk_size_days: u32,
}

impl FetchOrchestrator {
    pub fn new(
        adapter: Arc<dyn PlatformAdapter>,
        cache: CacheStore,
        config: &RetrievalConfig,
        images: ImageSettings,
    ) -> Self {
        Self {
            adapter,
            cache,
            fetch_gate: ConcurrencyGate::new("fetch", config.max_concurrent_fetches),
            download_gate: ConcurrencyGate::new("download", config.max_concurrent_downloads),
            images,
            retry: config.retry.clone(),
            chunk_size_days: config.chunk_size_days,
        }
    }

    pub fn fetch_gate(&self) -> &ConcurrencyGate {
        &self.fetch_gate
    }

    pub fn download_gate(&self) -> &ConcurrencyGate {
        &self.download_gate
    }

    /// Fetch, resolve and merge every message in the requested days.
    pub async fn fetch_range(&self, request: &FetchRequest) -> Result<FetchReport, FetchError> {
        if request.start > request.end {
            return Err(FetchError::InvalidRange {
                start: request.start,
                end: request.end,
            });
        }

        // Whole-conversation sources return messages from any day, which a
        // per-day cache cannot hold, so they are always fetched.
        let use_cache = request.use_cache && self.adapter.supports_range_queries();
        if request.use_cache && !use_cache {
            tracing::debug!(platform = %request.conversation.platform, "Day cache bypassed for whole-conversation fetch");
        }

        let mut segments: Vec<(NaiveDate, Vec<Message>)> = Vec::new();
        let mut to_fetch = Vec::new();
        for day in plan::requested_days(request.start, request.end) {
            if use_cache && self.cache.is_past_day(day, request.timezone) {
                let key = CacheKey::new(&request.conversation, day);
                if let Some(messages) = self.cache.get(&key, request.timezone).await {
                    tracing::info!(%day, count = messages.len(), "Cache HIT");
                    segments.push((day, messages));
                    continue;
                }
                tracing::info!(%day, "Cache MISS");
            }
            to_fetch.push(day);
        }
        let cached_days = segments.len();

        let chunks = plan::plan_chunks(&to_fetch, self.chunk_size_days, self.adapter.supports_range_queries());
        tracing::info!(
            days = to_fetch.len() + cached_days,
            cached_days,
            chunks = chunks.len(),
            limit = self.fetch_gate.limit(),
            "Planned fetch"
        );

        let ctx = Arc::new(ChunkContext {
            adapter: Arc::clone(&self.adapter),
            fetch_gate: self.fetch_gate.clone(),
            attachments: AttachmentPipeline::new(
                Arc::clone(&self.adapter),
                self.images.clone(),
                self.download_gate.clone(),
                self.retry.clone(),
            ),
            retry: self.retry.clone(),
            conversation: request.conversation.clone(),
            timezone: request.timezone,
        });

        let mut tasks = JoinSet::new();
        for (index, chunk) in chunks.iter().copied().enumerate() {
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move { (index, run_chunk(ctx, chunk).await) });
        }

        let mut outputs: Vec<Option<Result<ChunkOutput, AdapterError>>> = chunks.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Err(AdapterError::AuthExpired { platform }))) => {
                    tracing::error!(%platform, chunk = %chunks[index], "Credentials expired, aborting fetch");
                    tasks.abort_all();
                    return Err(FetchError::AuthExpired { platform });
                }
                Ok((index, result)) => outputs[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "Chunk task did not complete"),
            }
        }

        let mut report = FetchReport {
            cached_days,
            ..FetchReport::default()
        };
        for (chunk, output) in chunks.iter().zip(outputs) {
            match output {
                Some(Ok(out)) => {
                    report.succeeded_ranges.push(*chunk);
                    report.attachments.merge(&out.attachments);
                    segments.push((chunk.start, out.messages));
                }
                Some(Err(e)) => {
                    tracing::error!(%chunk, error = %e, "Chunk fetch failed");
                    report.failed_ranges.push(FailedRange {
                        chunk: *chunk,
                        reason: e.to_string(),
                    });
                }
                None => report.failed_ranges.push(FailedRange {
                    chunk: *chunk,
                    reason: "chunk task did not complete".to_string(),
                }),
            }
        }

        if !chunks.is_empty() && report.succeeded_ranges.is_empty() && cached_days == 0 {
            return Err(FetchError::Total {
                failed_ranges: report.failed_ranges,
            });
        }

        let mut messages = merge::merge_segments(segments);
        threads::relink(&mut messages);
        if use_cache {
            self.store_days(request, &report.succeeded_ranges, &messages).await;
        }
        report.messages = messages;

        if report.is_partial() {
            tracing::warn!(
                failed = report.failed_ranges.len(),
                succeeded = report.succeeded_ranges.len(),
                "Returning partial result"
            );
        }
        tracing::info!(
            messages = report.messages.len(),
            peak_fetches = self.fetch_gate.peak(),
            "Fetch complete"
        );
        Ok(report)
    }

    /// Cache every past day of the fetched chunks, empty days included, with
    /// thread ids as re-linked over the whole request.
    async fn store_days(&self, request: &FetchRequest, fetched: &[FetchChunk], messages: &[Message]) {
        let tz = request.timezone;
        let mut by_day: BTreeMap<NaiveDate, Vec<Message>> = fetched
            .iter()
            .flat_map(FetchChunk::days)
            .filter(|day| self.cache.is_past_day(*day, tz))
            .map(|day| (day, Vec::new()))
            .collect();
        for message in messages {
            if let Some(bucket) = by_day.get_mut(&tz.local_day(message.timestamp)) {
                bucket.push(message.clone());
            }
        }

        let writes = by_day.into_iter().map(|(day, day_messages)| async move {
            let key = CacheKey::new(&request.conversation, day);
            if let Err(e) = self.cache.put(&key, tz, &day_messages).await {
                tracing::warn!(%day, error = %e, "Failed to write cache entry");
            }
        });
        join_all(writes).await;
    }
}

/// Fetch, resolve, filter and enrich one chunk.
async fn run_chunk(ctx: Arc<ChunkContext>, chunk: FetchChunk) -> Result<ChunkOutput, AdapterError> {
    let (start, end) = chunk.window(ctx.timezone);
    let batch = {
        let _permit = ctx.fetch_gate.acquire().await;
        with_retry(&ctx.retry, "chunk fetch", || {
            ctx.adapter.fetch_raw(&ctx.conversation, start, end)
        })
        .await?
    };
    tracing::debug!(%chunk, raw = batch.len(), linkage = ?batch.linkage(), "Fetched chunk");

    // Comment trees come back whole and stay whole, so a post older than the
    // window still roots its comments.
    let whole_tree = matches!(batch, RawBatch::CommentTree(_));

    // Resolve before filtering so parents outside the window still link.
    let mut messages = threads::resolve(batch);
    if !whole_tree {
        messages.retain(|m| m.timestamp >= start && m.timestamp < end);
    }
    messages.retain(Message::has_content);

    let attachments = ctx.attachments.attach(&mut messages).await;
    Ok(ChunkOutput { messages, attachments })
}
