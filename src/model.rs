//! Core data types shared by every stage of the retrieval pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::threads::Linkage;
use crate::time::Timezone;

/// Supported messaging platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Telegram,
    Webex,
    Reddit,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Webex => "webex",
            Platform::Reddit => "reddit",
        }
    }

    /// How this platform expresses reply relationships natively.
    pub fn linkage(&self) -> Linkage {
        match self {
            Platform::Telegram => Linkage::ReplyChain,
            Platform::Webex => Linkage::ExplicitThread,
            Platform::Reddit => Linkage::CommentTree,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Ok(Platform::Telegram),
            "webex" => Ok(Platform::Webex),
            "reddit" => Ok(Platform::Reddit),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// Identifies one conversation of one user on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationRef {
    pub platform: Platform,
    pub user: String,
    pub conversation: String,
}

impl ConversationRef {
    pub fn new(platform: Platform, user: impl Into<String>, conversation: impl Into<String>) -> Self {
        Self {
            platform,
            user: user.into(),
            conversation: conversation.into(),
        }
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.platform, self.user, self.conversation)
    }
}

/// Message author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub name: String,
}

impl Author {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A platform-side reference to an attachment that has not been downloaded yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// URL or export-relative path, interpreted by the owning adapter.
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_size: Option<u64>,
}

impl AttachmentRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            declared_mime: None,
            declared_size: None,
        }
    }
}

/// A downloaded, validated and base64-encoded attachment.
///
/// Only constructed after validation passed; a rejected attachment is omitted
/// from its message entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    /// Standard base64 of the source bytes.
    pub data: String,
    pub size_bytes: u64,
}

/// A fully resolved message.
///
/// `thread_id` is the id of the topmost message of the thread; a message that
/// replies to nothing is its own root (`thread_id == id`, `parent_id == None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub author: Author,
    pub timestamp: DateTime<Utc>,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_refs: Vec<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// A standalone root message with no attachments.
    pub fn new(
        id: impl Into<String>,
        author: Author,
        timestamp: DateTime<Utc>,
        text: Option<String>,
    ) -> Self {
        let id = id.into();
        Self {
            thread_id: id.clone(),
            id,
            text,
            author,
            timestamp,
            parent_id: None,
            attachment_refs: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether the message carries text or media. Media counts whether or not
    /// its download later succeeds.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || !self.attachment_refs.is_empty()
            || !self.attachments.is_empty()
    }
}

/// A contiguous, day-aligned sub-range `[start, end)` of a requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FetchChunk {
    /// First calendar day covered.
    pub start: NaiveDate,
    /// First calendar day *not* covered.
    pub end: NaiveDate,
}

impl FetchChunk {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// A chunk covering exactly one day.
    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day + Days::new(1),
        }
    }

    pub fn len_days(&self) -> u64 {
        (self.end - self.start).num_days().max(0) as u64
    }

    /// Calendar days covered, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let start = self.start;
        (0..self.len_days()).map(move |offset| start + Days::new(offset))
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    /// The half-open UTC instant window `[start 00:00 local, end 00:00 local)`.
    pub fn window(&self, tz: Timezone) -> (DateTime<Utc>, DateTime<Utc>) {
        (tz.day_start_utc(self.start), tz.day_start_utc(self.end))
    }
}

impl fmt::Display for FetchChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A chunk that could not be retrieved, with the reason it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRange {
    pub chunk: FetchChunk,
    pub reason: String,
}
