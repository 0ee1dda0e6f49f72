//! Telegram adapter over Telegram Desktop JSON exports.
//!
//! Each conversation is a directory `<export_dir>/<conversation>/` holding the
//! export's `result.json` and its media folders. Messages link to each other
//! only through `reply_to_message_id`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;

use crate::error::AdapterError;
use crate::model::{AttachmentRef, Author, ConversationRef, Platform};
use crate::platforms::{AttachmentBytes, AttachmentMeta, PlatformAdapter, RawBatch, RawMessage};

const EXPORT_FILE: &str = "result.json";

#[derive(Debug, Deserialize)]
struct TelegramExport {
    #[serde(default)]
    messages: Vec<ExportMessage>,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    date_unixtime: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    from_id: Option<String>,
    #[serde(default)]
    text: Option<Value>,
    #[serde(default)]
    reply_to_message_id: Option<i64>,
    #[serde(default)]
    photo: Option<String>,
    #[serde(default)]
    photo_file_size: Option<u64>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Flatten Telegram's `text` field, which is a string or an array of strings
/// and entity objects.
fn flatten_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect(),
        _ => String::new(),
    }
}

/// MIME type implied by a file extension.
fn mime_from_extension(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "mp4" => Some("video/mp4"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

/// A relative path with no root, prefix or parent components.
fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl ExportMessage {
    fn into_raw(self, conversation: &str) -> Option<RawMessage> {
        if self.kind != "message" {
            return None;
        }
        let timestamp = self
            .date_unixtime
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))?;

        let author = Author::new(
            self.from_id.clone().unwrap_or_default(),
            self.from.clone().unwrap_or_else(|| "Deleted Account".to_string()),
        );
        let mut raw = RawMessage::new(self.id.to_string(), author, timestamp);
        raw.text = self
            .text
            .as_ref()
            .map(flatten_text)
            .filter(|t| !t.trim().is_empty());
        raw.reply_to = self.reply_to_message_id.map(|id| id.to_string());

        let media = [
            (self.photo, self.photo_file_size, Some("image/jpeg".to_string())),
            (self.file, self.file_size, self.mime_type),
        ];
        for (path, size, mime) in media {
            // Media left out of the export shows up as a "(File not included...)" note.
            let Some(path) = path.filter(|p| !p.starts_with('(')) else {
                continue;
            };
            let mut reference = AttachmentRef::new(format!("{conversation}/{path}"));
            reference.declared_size = size;
            reference.declared_mime = mime_from_extension(&path).map(str::to_string).or(mime);
            raw.attachments.push(reference);
        }
        Some(raw)
    }
}

/// Parse a `result.json` body into raw messages.
fn parse_export(bytes: &[u8], conversation: &str) -> Result<Vec<RawMessage>, AdapterError> {
    let export: TelegramExport = serde_json::from_slice(bytes).map_err(|e| AdapterError::InvalidResponse {
        platform: Platform::Telegram,
        reason: format!("unreadable export: {e}"),
    })?;
    Ok(export
        .messages
        .into_iter()
        .filter_map(|m| m.into_raw(conversation))
        .collect())
}

fn io_error(err: std::io::Error, resource: &Path) -> AdapterError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AdapterError::NotFound {
            platform: Platform::Telegram,
            resource: resource.display().to_string(),
        }
    } else {
        AdapterError::Transient {
            platform: Platform::Telegram,
            reason: format!("{}: {err}", resource.display()),
        }
    }
}

/// Reads conversations from a directory of Telegram Desktop exports.
pub struct TelegramExportAdapter {
    export_dir: PathBuf,
}

impl TelegramExportAdapter {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
        }
    }

    /// Resolve an export-relative path, refusing anything that escapes the
    /// export directory.
    fn resolve(&self, relative: &str) -> Result<PathBuf, AdapterError> {
        let path = Path::new(relative);
        if relative.is_empty() || !is_contained(path) {
            return Err(AdapterError::NotFound {
                platform: Platform::Telegram,
                resource: relative.to_string(),
            });
        }
        Ok(self.export_dir.join(path))
    }
}

#[async_trait]
impl PlatformAdapter for TelegramExportAdapter {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn fetch_raw(
        &self,
        conversation: &ConversationRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RawBatch, AdapterError> {
        let dir = self.resolve(&conversation.conversation)?;
        let path = dir.join(EXPORT_FILE);
        let bytes = fs::read(&path).await.map_err(|e| io_error(e, &path))?;

        let mut messages = parse_export(&bytes, &conversation.conversation)?;
        let total = messages.len();
        messages.retain(|m| m.timestamp >= start && m.timestamp < end);
        tracing::debug!(path = %path.display(), total, in_window = messages.len(), "Read Telegram export");
        Ok(RawBatch::ReplyChain(messages))
    }

    async fn probe_attachment(&self, reference: &AttachmentRef) -> Result<AttachmentMeta, AdapterError> {
        let path = self.resolve(&reference.location)?;
        let meta = fs::metadata(&path).await.map_err(|e| io_error(e, &path))?;
        Ok(AttachmentMeta {
            mime_type: reference
                .declared_mime
                .clone()
                .or_else(|| mime_from_extension(&reference.location).map(str::to_string)),
            size: Some(meta.len()),
        })
    }

    async fn fetch_attachment_bytes(&self, reference: &AttachmentRef) -> Result<AttachmentBytes, AdapterError> {
        let path = self.resolve(&reference.location)?;
        let bytes = fs::read(&path).await.map_err(|e| io_error(e, &path))?;
        let mime_type = reference
            .declared_mime
            .clone()
            .or_else(|| mime_from_extension(&reference.location).map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(AttachmentBytes { bytes, mime_type })
    }
}
