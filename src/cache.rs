//! File-backed daily message cache.
//!
//! One JSON file per conversation per calendar day:
//! `<root>/<platform>/<user>/<conversation>/<YYYY-MM-DD>.json`
//!
//! Only days strictly before "today" (in the caller's timezone) are ever read
//! or written. Corrupt entries are deleted and reported as misses.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::fs;

use crate::error::CacheError;
use crate::model::{ConversationRef, Message, Platform};
use crate::time::{Clock, SystemClock, Timezone};

/// Identifies one cached day of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub platform: Platform,
    pub user: String,
    pub conversation: String,
    pub day: NaiveDate,
}

impl CacheKey {
    pub fn new(conversation: &ConversationRef, day: NaiveDate) -> Self {
        Self {
            platform: conversation.platform,
            user: conversation.user.clone(),
            conversation: conversation.conversation.clone(),
            day,
        }
    }
}

/// Encode a user or conversation id as a single path component. ASCII
/// alphanumerics, `-` and `_` pass through; every other byte becomes `%XX`,
/// so distinct ids never share a directory. An empty id encodes as `%`.
fn encode_component(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// File-backed cache of resolved messages, one file per day.
#[derive(Clone)]
pub struct CacheStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").field("root", &self.root).finish()
    }
}

impl CacheStore {
    /// Create a cache rooted at `root`, using wall-clock time for freshness.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_clock(root, Arc::new(SystemClock))
    }

    pub fn with_clock(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn conversation_dir(&self, platform: Platform, user: &str, conversation: &str) -> PathBuf {
        self.root
            .join(platform.as_str())
            .join(encode_component(user))
            .join(encode_component(conversation))
    }

    /// On-disk location of an entry.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.conversation_dir(key.platform, &key.user, &key.conversation)
            .join(format!("{}.json", key.day.format("%Y-%m-%d")))
    }

    /// Whether `day` is strictly before today in `tz`, i.e. cacheable.
    pub fn is_past_day(&self, day: NaiveDate, tz: Timezone) -> bool {
        day < tz.today(self.clock.as_ref())
    }

    /// Read a day's messages. Today, future days, absent entries and corrupt
    /// entries all report `None`.
    pub async fn get(&self, key: &CacheKey, tz: Timezone) -> Option<Vec<Message>> {
        if !self.is_past_day(key.day, tz) {
            tracing::debug!(day = %key.day, "Day is not in the past, skipping cache read");
            return None;
        }

        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read cache entry");
                return None;
            }
        };

        match serde_json::from_slice::<Vec<Message>>(&bytes) {
            Ok(messages) => Some(messages),
            Err(e) => {
                let err = CacheError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(error = %err, "Invalidating corrupt cache entry");
                if let Err(e) = self.invalidate(key).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove corrupt cache entry");
                }
                None
            }
        }
    }

    /// Atomically write a day's messages.
    ///
    /// Writes for today or future days are skipped. The entry becomes visible
    /// only once fully written; concurrent writers for one key race with
    /// last-writer-wins.
    pub async fn put(&self, key: &CacheKey, tz: Timezone, messages: &[Message]) -> Result<(), CacheError> {
        if !self.is_past_day(key.day, tz) {
            tracing::debug!(day = %key.day, "Day is not in the past, skipping cache write");
            return Ok(());
        }

        let path = self.path_for(key);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec(messages)?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&body)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| CacheError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        tracing::debug!(path = %path.display(), count = messages.len(), "Wrote cache entry");
        Ok(())
    }

    /// Delete one entry. Returns whether a file was removed.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every cached day of a conversation. Returns how many entries
    /// were removed.
    pub async fn invalidate_conversation(&self, conversation: &ConversationRef) -> Result<usize, CacheError> {
        let dir = self.conversation_dir(conversation.platform, &conversation.user, &conversation.conversation);
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        // Leftover temp files from interrupted writes keep the directory alive.
        let _ = fs::remove_dir(&dir).await;

        tracing::info!(%conversation, removed, "Invalidated cached conversation");
        Ok(removed)
    }
}
