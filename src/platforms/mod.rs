//! Platform adapters: the per-platform primitives that fetch raw messages and
//! attachment bytes.
//!
//! Each platform hands back its messages in its native linkage shape
//! ([`RawBatch`]); the thread resolver turns that into uniform
//! `(thread_id, parent_id)` pairs.

pub mod reddit;
pub mod telegram;
pub mod webex;

pub use reddit::RedditAdapter;
pub use telegram::TelegramExportAdapter;
pub use webex::WebexAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AdapterError, FetchError};
use crate::model::{Attachment, AttachmentRef, Author, ConversationRef, Message, Platform};
use crate::threads::Linkage;

/// A message as delivered by a platform, before thread resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    pub text: Option<String>,
    pub author: Author,
    pub timestamp: DateTime<Utc>,
    /// Direct reply pointer, when the platform has one.
    pub reply_to: Option<String>,
    /// Explicit thread grouping key, when the platform has one.
    pub thread_key: Option<String>,
    pub attachments: Vec<AttachmentRef>,
}

impl RawMessage {
    pub fn new(id: impl Into<String>, author: Author, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            text: None,
            author,
            timestamp,
            reply_to: None,
            thread_key: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_reply_to(mut self, parent: impl Into<String>) -> Self {
        self.reply_to = Some(parent.into());
        self
    }

    pub fn with_thread_key(mut self, key: impl Into<String>) -> Self {
        self.thread_key = Some(key.into());
        self
    }

    pub fn with_attachment(mut self, reference: AttachmentRef) -> Self {
        self.attachments.push(reference);
        self
    }

    /// Attach resolved linkage, producing a [`Message`].
    pub fn into_message(self, thread_id: String, parent_id: Option<String>) -> Message {
        Message {
            id: self.id,
            text: self.text,
            author: self.author,
            timestamp: self.timestamp,
            thread_id,
            parent_id,
            attachment_refs: self.attachments,
            attachments: Vec::<Attachment>::new(),
        }
    }
}

/// One node of a nested comment tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentNode {
    pub message: RawMessage,
    pub children: Vec<CommentNode>,
}

impl CommentNode {
    pub fn leaf(message: RawMessage) -> Self {
        Self {
            message,
            children: Vec::new(),
        }
    }

    pub fn with_children(message: RawMessage, children: Vec<CommentNode>) -> Self {
        Self { message, children }
    }
}

/// Raw messages in the platform's native linkage shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawBatch {
    /// Messages carry an explicit thread key.
    ExplicitThread(Vec<RawMessage>),
    /// Messages carry only a `reply_to` pointer.
    ReplyChain(Vec<RawMessage>),
    /// A forest of nested comment trees, one per root post.
    CommentTree(Vec<CommentNode>),
}

impl RawBatch {
    pub fn linkage(&self) -> Linkage {
        match self {
            RawBatch::ExplicitThread(_) => Linkage::ExplicitThread,
            RawBatch::ReplyChain(_) => Linkage::ReplyChain,
            RawBatch::CommentTree(_) => Linkage::CommentTree,
        }
    }

    /// Total number of raw messages, counting every tree node.
    pub fn len(&self) -> usize {
        match self {
            RawBatch::ExplicitThread(v) | RawBatch::ReplyChain(v) => v.len(),
            RawBatch::CommentTree(roots) => {
                let mut count = 0;
                let mut stack: Vec<&CommentNode> = roots.iter().collect();
                while let Some(node) = stack.pop() {
                    count += 1;
                    stack.extend(node.children.iter());
                }
                count
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a lightweight attachment probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

/// Downloaded attachment content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentBytes {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl AttachmentBytes {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Per-platform fetch primitive.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether `fetch_raw` honours the time window. Adapters that always return
    /// the whole conversation are fetched once per contiguous run of days.
    fn supports_range_queries(&self) -> bool {
        true
    }

    /// Fetch raw messages with timestamps in `[start, end)`. Adapters may return
    /// extra messages outside the window; the caller filters them.
    async fn fetch_raw(
        &self,
        conversation: &ConversationRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RawBatch, AdapterError>;

    /// Cheap size/type check before a full download. Defaults to the values
    /// declared on the reference.
    async fn probe_attachment(&self, reference: &AttachmentRef) -> Result<AttachmentMeta, AdapterError> {
        Ok(AttachmentMeta {
            mime_type: reference.declared_mime.clone(),
            size: reference.declared_size,
        })
    }

    async fn fetch_attachment_bytes(&self, reference: &AttachmentRef) -> Result<AttachmentBytes, AdapterError>;
}

/// Adapters keyed by platform.
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same platform.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        let platform = adapter.platform();
        if self.adapters.insert(platform, adapter).is_some() {
            tracing::warn!(%platform, "Replaced existing platform adapter");
        }
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>, FetchError> {
        self.adapters
            .get(&platform)
            .cloned()
            .ok_or(FetchError::UnknownPlatform { platform })
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut list: Vec<Platform> = self.adapters.keys().copied().collect();
        list.sort_by_key(|p| p.as_str());
        list
    }
}
