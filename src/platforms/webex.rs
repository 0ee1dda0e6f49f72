//! Webex adapter: reads room messages over the REST API.
//!
//! Messages carry an explicit `parentId` thread key. Listing is newest first,
//! so the first page ends at the window end (`before`) and later pages
//! continue from the oldest message seen (`beforeMessage`).

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::AdapterError;
use crate::model::{AttachmentRef, Author, ConversationRef, Platform};
use crate::platforms::{AttachmentBytes, AttachmentMeta, PlatformAdapter, RawBatch, RawMessage};

const DEFAULT_BASE_URL: &str = "https://webexapis.com/v1";
const PAGE_SIZE: usize = 1000;
const MAX_PAGES: usize = 200;

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    items: Vec<WebexMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebexMessage {
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    person_id: Option<String>,
    #[serde(default)]
    person_email: Option<String>,
    created: DateTime<Utc>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    files: Vec<String>,
}

impl WebexMessage {
    fn into_raw(self) -> RawMessage {
        let author = Author::new(
            self.person_id.clone().unwrap_or_default(),
            self.person_email
                .clone()
                .or(self.person_id.clone())
                .unwrap_or_else(|| "unknown".to_string()),
        );
        let mut raw = RawMessage::new(self.id, author, self.created);
        raw.text = self.text.or(self.markdown).filter(|t| !t.is_empty());
        raw.thread_key = self.parent_id;
        raw.attachments = self.files.into_iter().map(AttachmentRef::new).collect();
        raw
    }
}

/// Webex REST adapter.
pub struct WebexAdapter {
    token: SecretString,
    base_url: String,
    client: reqwest::Client,
}

impl WebexAdapter {
    pub fn new(token: SecretString) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Point the adapter at another API root (proxies, test servers).
    pub fn with_base_url(token: SecretString, base_url: impl Into<String>) -> Self {
        Self {
            token,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn fetch_page(&self, room_id: &str, cursor: &PageCursor) -> Result<Vec<WebexMessage>, AdapterError> {
        let max = PAGE_SIZE.to_string();
        let (key, value) = match cursor {
            PageCursor::Before(instant) => ("before", instant.to_rfc3339_opts(SecondsFormat::Millis, true)),
            PageCursor::BeforeMessage(id) => ("beforeMessage", id.clone()),
        };
        let resp = self
            .client
            .get(self.api_url("messages"))
            .bearer_auth(self.token.expose_secret())
            .query(&[("roomId", room_id), ("max", max.as_str()), (key, value.as_str())])
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(Platform::Webex, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(Platform::Webex, status, room_id));
        }
        let page: MessagePage = resp
            .json()
            .await
            .map_err(|e| AdapterError::from_reqwest(Platform::Webex, e))?;
        Ok(page.items)
    }
}

/// Where the next page of a backwards walk starts. `before` is exclusive on
/// timestamps, so only the first page uses it; later pages anchor on the
/// oldest message id to keep messages that share its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PageCursor {
    Before(DateTime<Utc>),
    BeforeMessage(String),
}

/// Keep the messages of one page that fall in `[start, end)`. Returns the id
/// of the page's last (oldest) message when the walk should continue past it.
fn collect_page(
    items: Vec<WebexMessage>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    out: &mut Vec<RawMessage>,
) -> Option<String> {
    let full = items.len() >= PAGE_SIZE;
    let oldest = items
        .last()
        .filter(|m| full && m.created >= start)
        .map(|m| m.id.clone());
    out.extend(
        items
            .into_iter()
            .filter(|m| m.created >= start && m.created < end)
            .map(WebexMessage::into_raw),
    );
    oldest
}

#[async_trait]
impl PlatformAdapter for WebexAdapter {
    fn platform(&self) -> Platform {
        Platform::Webex
    }

    async fn fetch_raw(
        &self,
        conversation: &ConversationRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RawBatch, AdapterError> {
        let mut out = Vec::new();
        let mut cursor = PageCursor::Before(end);
        for page in 0..MAX_PAGES {
            let items = self.fetch_page(&conversation.conversation, &cursor).await?;
            tracing::debug!(room = %conversation.conversation, page, count = items.len(), "Fetched Webex page");
            let next = match collect_page(items, start, end, &mut out) {
                Some(oldest) => PageCursor::BeforeMessage(oldest),
                None => return Ok(RawBatch::ExplicitThread(out)),
            };
            // A cursor that does not move would loop forever.
            if next == cursor {
                return Ok(RawBatch::ExplicitThread(out));
            }
            cursor = next;
        }
        tracing::warn!(room = %conversation.conversation, pages = MAX_PAGES, "Stopped paging Webex room");
        Ok(RawBatch::ExplicitThread(out))
    }

    async fn probe_attachment(&self, reference: &AttachmentRef) -> Result<AttachmentMeta, AdapterError> {
        let resp = self
            .client
            .head(&reference.location)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(Platform::Webex, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(Platform::Webex, status, &reference.location));
        }

        let headers = resp.headers();
        Ok(AttachmentMeta {
            mime_type: headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .or_else(|| reference.declared_mime.clone()),
            size: headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .or(reference.declared_size),
        })
    }

    async fn fetch_attachment_bytes(&self, reference: &AttachmentRef) -> Result<AttachmentBytes, AdapterError> {
        let resp = self
            .client
            .get(&reference.location)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(Platform::Webex, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(Platform::Webex, status, &reference.location));
        }

        let mime_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AdapterError::from_reqwest(Platform::Webex, e))?;
        Ok(AttachmentBytes {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, hour, 0, 0).unwrap()
    }

    #[test]
    fn parses_message_fields() {
        let page: MessagePage = serde_json::from_value(json!({
            "items": [{
                "id": "m2",
                "roomId": "r",
                "text": "reply",
                "personId": "p1",
                "personEmail": "alice@example.com",
                "created": "2024-04-02T10:00:00.000Z",
                "parentId": "m1",
                "files": ["https://webexapis.com/v1/contents/abc"]
            }]
        }))
        .unwrap();
        let raw = page.items.into_iter().next().unwrap().into_raw();
        assert_eq!(raw.thread_key.as_deref(), Some("m1"));
        assert_eq!(raw.author.name, "alice@example.com");
        assert_eq!(raw.text.as_deref(), Some("reply"));
        assert_eq!(raw.attachments.len(), 1);
        assert_eq!(raw.timestamp, at(10));
    }

    #[test]
    fn short_page_ends_walk_and_filters_window() {
        let items: Vec<WebexMessage> = serde_json::from_value(json!([
            {"id": "late", "created": "2024-04-02T20:00:00Z"},
            {"id": "in", "created": "2024-04-02T10:00:00Z", "text": "hi"},
            {"id": "early", "created": "2024-04-02T01:00:00Z"}
        ]))
        .unwrap();
        let mut out = Vec::new();
        let next = collect_page(items, at(5), at(15), &mut out);
        assert!(next.is_none());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "in");
    }

    fn full_page(created: impl Fn(usize) -> &'static str) -> Vec<WebexMessage> {
        (0..PAGE_SIZE)
            .map(|i| {
                serde_json::from_value(json!({"id": format!("m{i}"), "created": created(i), "text": "x"}))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn full_page_continues_from_last_message_id() {
        // The tail of the page shares one timestamp; paging by time alone
        // would skip the rest of that second on the next page.
        let items = full_page(|i| {
            if i < PAGE_SIZE - 3 {
                "2024-04-02T12:00:00Z"
            } else {
                "2024-04-02T09:00:00Z"
            }
        });
        let mut out = Vec::new();
        let next = collect_page(items, at(5), at(15), &mut out);
        assert_eq!(next.as_deref(), Some("m999"));
        assert_eq!(out.len(), PAGE_SIZE);
    }

    #[test]
    fn full_page_older_than_window_stops() {
        let items = full_page(|_| "2024-04-02T01:00:00Z");
        let mut out = Vec::new();
        assert!(collect_page(items, at(5), at(15), &mut out).is_none());
        assert!(out.is_empty());
    }
}
