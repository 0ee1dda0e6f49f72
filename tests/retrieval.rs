//! End-to-end retrieval through `MessageService` with in-memory adapters.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tempfile::TempDir;

use chat_harvest::cache::CacheStore;
use chat_harvest::config::{ImageSettingsOverride, RetrievalConfig, RetryPolicy};
use chat_harvest::error::{AdapterError, FetchError};
use chat_harvest::model::{AttachmentRef, Author, ConversationRef};
use chat_harvest::platforms::{
    AttachmentBytes, CommentNode, PlatformAdapter, PlatformRegistry, RawBatch, RawMessage,
};
use chat_harvest::threads::linearize;
use chat_harvest::time::FixedClock;
use chat_harvest::{GetMessagesRequest, MessageService, Platform};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, day, hour, 0, 0).unwrap()
}

fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 2, n).unwrap()
}

/// A group chat where each day's second message replies to the previous
/// day's last one, and every third day carries an image.
struct ChatAdapter {
    messages: Vec<RawMessage>,
    /// Window starts that fail with a transient error every time.
    broken_days: Vec<DateTime<Utc>>,
    fetches: AtomicUsize,
    downloads: AtomicUsize,
}

impl ChatAdapter {
    fn new() -> Self {
        let mut messages = Vec::new();
        let mut previous: Option<String> = None;
        for d in 1..=14 {
            let opener = RawMessage::new(format!("d{d}-a"), Author::new("alice", "Alice"), at(d, 8))
                .with_text(format!("morning {d}"));
            let mut reply = RawMessage::new(format!("d{d}-b"), Author::new("bob", "Bob"), at(d, 17))
                .with_text(format!("evening {d}"));
            if let Some(p) = &previous {
                reply = reply.with_reply_to(p.clone());
            }
            if d % 3 == 0 {
                reply = reply.with_attachment(AttachmentRef::new(format!("img-{d}")));
            }
            previous = Some(reply.id.clone());
            messages.push(opener);
            messages.push(reply);
        }
        Self {
            messages,
            broken_days: Vec::new(),
            fetches: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PlatformAdapter for ChatAdapter {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn fetch_raw(
        &self,
        _conversation: &ConversationRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RawBatch, AdapterError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        if self.broken_days.contains(&start) {
            return Err(AdapterError::Transient {
                platform: Platform::Telegram,
                reason: "connection reset".into(),
            });
        }
        Ok(RawBatch::ReplyChain(
            self.messages
                .iter()
                .filter(|m| m.timestamp >= start && m.timestamp < end)
                .cloned()
                .collect(),
        ))
    }

    async fn fetch_attachment_bytes(&self, _reference: &AttachmentRef) -> Result<AttachmentBytes, AdapterError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(AttachmentBytes {
            bytes: PNG.to_vec(),
            mime_type: "application/octet-stream".into(),
        })
    }
}

/// A Reddit-like adapter that ignores the window and returns the whole tree.
struct TreeAdapter {
    fetches: AtomicUsize,
}

#[async_trait]
impl PlatformAdapter for TreeAdapter {
    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    fn supports_range_queries(&self) -> bool {
        false
    }

    async fn fetch_raw(
        &self,
        _conversation: &ConversationRef,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<RawBatch, AdapterError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let node = |id: &str, d: u32, children: Vec<CommentNode>| {
            CommentNode::with_children(
                RawMessage::new(id, Author::new("u", "U"), at(d, 12)).with_text(id),
                children,
            )
        };
        Ok(RawBatch::CommentTree(vec![node(
            "post",
            1,
            vec![node("c1", 2, vec![node("c1a", 5, vec![])]), node("c2", 3, vec![])],
        )]))
    }

    async fn fetch_attachment_bytes(&self, reference: &AttachmentRef) -> Result<AttachmentBytes, AdapterError> {
        Err(AdapterError::NotFound {
            platform: Platform::Reddit,
            resource: reference.location.clone(),
        })
    }
}

fn config(dir: &TempDir) -> RetrievalConfig {
    RetrievalConfig {
        chunk_size_days: 3,
        max_concurrent_fetches: 2,
        max_concurrent_downloads: 2,
        cache_dir: dir.path().to_path_buf(),
        retry: RetryPolicy::immediate(2),
        ..RetrievalConfig::default()
    }
}

fn service(dir: &TempDir, adapter: Arc<dyn PlatformAdapter>) -> MessageService {
    let mut registry = PlatformRegistry::new();
    registry.register(adapter);
    let clock = Arc::new(FixedClock(at(20, 9)));
    MessageService::with_cache(registry, config(dir), CacheStore::with_clock(dir.path(), clock))
}

fn request(platform: Platform, start: u32, end: u32) -> GetMessagesRequest {
    GetMessagesRequest::new(platform, "me@example.com", "group-1", day(start), day(end))
}

#[tokio::test]
async fn reply_chain_spans_chunks_and_attachments_resolve() {
    let dir = TempDir::new().unwrap();
    let adapter = Arc::new(ChatAdapter::new());
    let svc = service(&dir, adapter.clone());

    let mut req = request(Platform::Telegram, 1, 14);
    req.images = Some(ImageSettingsOverride {
        enabled: Some(true),
        allowed_mime_types: Some(vec!["image/png".into()]),
        ..ImageSettingsOverride::default()
    });
    let report = svc.get_messages(req).await.unwrap();

    assert!(!report.is_partial());
    assert_eq!(report.messages.len(), 28);
    // Sorted by timestamp.
    assert!(report.messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    // The evening chain crosses every chunk boundary yet shares one root.
    let evenings: Vec<_> = report.messages.iter().filter(|m| m.id.ends_with("-b")).collect();
    assert!(evenings.iter().all(|m| m.thread_id == "d1-b"));
    // Mornings reply to nothing.
    assert!(
        report
            .messages
            .iter()
            .filter(|m| m.id.ends_with("-a"))
            .all(|m| m.thread_id == m.id && m.parent_id.is_none())
    );

    let with_images: Vec<_> = report.messages.iter().filter(|m| !m.attachments.is_empty()).collect();
    assert_eq!(with_images.len(), 4);
    assert!(with_images.iter().all(|m| m.attachments[0].mime_type == "image/png"));
    assert_eq!(adapter.downloads.load(Ordering::SeqCst), 4);
    assert_eq!(report.attachments.resolved, 4);
}

#[tokio::test]
async fn cached_days_are_not_refetched_and_keep_thread_ids() {
    let dir = TempDir::new().unwrap();
    let adapter = Arc::new(ChatAdapter::new());
    let svc = service(&dir, adapter.clone());

    let first = svc.get_messages(request(Platform::Telegram, 1, 14)).await.unwrap();
    let fetches = adapter.fetches.load(Ordering::SeqCst);

    // A narrower request served entirely from cache still sees the chain root.
    let second = svc.get_messages(request(Platform::Telegram, 10, 12)).await.unwrap();
    assert_eq!(adapter.fetches.load(Ordering::SeqCst), fetches);
    assert_eq!(second.cached_days, 3);
    let late = second.messages.iter().find(|m| m.id == "d11-b").unwrap();
    assert_eq!(late.thread_id, "d1-b");

    let original = first.messages.iter().find(|m| m.id == "d11-b").unwrap();
    assert_eq!(late, original);
}

#[tokio::test]
async fn failing_chunks_yield_partial_report() {
    let dir = TempDir::new().unwrap();
    let mut adapter = ChatAdapter::new();
    // Chunks of 3 days over 1..=14 start on 1, 4, 7, 10, 13.
    adapter.broken_days = vec![at(4, 0), at(10, 0)];
    let svc = service(&dir, Arc::new(adapter));

    let report = svc.get_messages(request(Platform::Telegram, 1, 14)).await.unwrap();
    assert_eq!(report.succeeded_ranges.len(), 3);
    assert_eq!(report.failed_ranges.len(), 2);
    assert_eq!(report.messages.len(), 28 - 12);
    assert!(report.failed_ranges.iter().all(|f| f.reason.contains("connection reset")));

    assert!(matches!(
        report.into_strict(),
        Err(FetchError::Partial { ref failed_ranges, .. }) if failed_ranges.len() == 2
    ));
}

#[tokio::test]
async fn failed_days_are_not_cached() {
    let dir = TempDir::new().unwrap();
    let mut broken = ChatAdapter::new();
    broken.broken_days = vec![at(4, 0)];
    service(&dir, Arc::new(broken))
        .get_messages(request(Platform::Telegram, 1, 6))
        .await
        .unwrap();

    let healthy = Arc::new(ChatAdapter::new());
    let report = service(&dir, healthy.clone())
        .get_messages(request(Platform::Telegram, 1, 6))
        .await
        .unwrap();
    assert_eq!(report.cached_days, 3);
    assert_eq!(healthy.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(report.messages.len(), 12);
}

#[tokio::test]
async fn comment_tree_is_returned_whole_with_its_post() {
    let dir = TempDir::new().unwrap();
    let adapter = Arc::new(TreeAdapter {
        fetches: AtomicUsize::new(0),
    });
    let svc = service(&dir, adapter.clone());

    // The post predates the window and c1a falls after it; both are kept.
    let report = svc.get_messages(request(Platform::Reddit, 2, 3)).await.unwrap();
    assert_eq!(adapter.fetches.load(Ordering::SeqCst), 1);
    let ids: Vec<_> = report.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["post", "c1", "c2", "c1a"]);
    assert!(report.messages.iter().all(|m| m.thread_id == "post"));

    let view = linearize(&report.messages);
    let shape: Vec<_> = view
        .iter()
        .map(|e| (e.message.id.as_str(), e.depth, e.orphaned))
        .collect();
    assert_eq!(
        shape,
        vec![("post", 0, false), ("c1", 1, false), ("c1a", 2, false), ("c2", 1, false)]
    );

    // Whole trees are not held in the day cache, so a repeat fetches again.
    assert_eq!(report.cached_days, 0);
    svc.get_messages(request(Platform::Reddit, 2, 3)).await.unwrap();
    assert_eq!(adapter.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn timezone_shifts_day_boundaries() {
    let dir = TempDir::new().unwrap();
    let svc = service(&dir, Arc::new(ChatAdapter::new()));

    // At -10:00, Feb 2 local runs from Feb 2 10:00 UTC to Feb 3 10:00 UTC:
    // day 2's evening and day 3's morning.
    let mut req = request(Platform::Telegram, 2, 2);
    req.timezone = Some("-10:00".into());
    req.use_cache = false;
    let report = svc.get_messages(req).await.unwrap();
    let ids: Vec<_> = report.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["d2-b", "d3-a"]);
}
