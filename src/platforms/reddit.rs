//! Reddit adapter: a post and its comment forest.
//!
//! The conversation id is a post id. Reddit has no time-range query for
//! comments, so the whole tree is returned. "More comments" stubs are expanded
//! through `/api/morechildren` and grafted under their parents.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::error::AdapterError;
use crate::model::{AttachmentRef, Author, ConversationRef, Platform};
use crate::platforms::{AttachmentBytes, CommentNode, PlatformAdapter, RawBatch, RawMessage};

const DEFAULT_BASE_URL: &str = "https://oauth.reddit.com";
/// Most `/api/morechildren` calls made for one thread.
const MAX_MORE_REQUESTS: usize = 32;
/// Most comment ids the endpoint accepts per call.
const MORE_BATCH: usize = 100;

/// Reddit OAuth API adapter.
pub struct RedditAdapter {
    token: SecretString,
    user_agent: String,
    base_url: String,
    client: reqwest::Client,
}

impl RedditAdapter {
    pub fn new(token: SecretString, user_agent: impl Into<String>) -> Self {
        Self::with_base_url(token, user_agent, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: SecretString, user_agent: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            token,
            user_agent: user_agent.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> AdapterError {
    AdapterError::InvalidResponse {
        platform: Platform::Reddit,
        reason: reason.into(),
    }
}

fn author_of(data: &Value) -> Author {
    let name = data
        .get("author")
        .and_then(Value::as_str)
        .unwrap_or("[deleted]");
    let id = data
        .get("author_fullname")
        .and_then(Value::as_str)
        .unwrap_or("0");
    Author::new(id, name)
}

fn created_of(data: &Value) -> Option<DateTime<Utc>> {
    let secs = data.get("created_utc").and_then(Value::as_f64)?;
    DateTime::from_timestamp(secs as i64, 0)
}

/// Strip a `t1_`/`t3_` kind prefix from a fullname.
fn bare_id(fullname: &str) -> &str {
    fullname.split_once('_').map_or(fullname, |(_, id)| id)
}

/// Parse one thing of a listing. `t1` comments come back with their replies;
/// `more` stubs contribute their child ids to `more`.
/// serde_json caps nesting depth, so the recursion here is bounded.
fn parse_comment(thing: &Value, more: &mut Vec<String>) -> Option<CommentNode> {
    let data = thing.get("data")?;
    match thing.get("kind").and_then(Value::as_str) {
        Some("t1") => {}
        Some("more") => {
            let ids = data.get("children").and_then(Value::as_array)?;
            // "Continue this thread" stubs carry no ids.
            more.extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
            return None;
        }
        _ => return None,
    }
    let id = data.get("id").and_then(Value::as_str)?;
    let Some(created) = created_of(data) else {
        tracing::debug!(id, "Skipping Reddit comment without timestamp");
        return None;
    };

    let mut message = RawMessage::new(id, author_of(data), created);
    message.text = data
        .get("body")
        .and_then(Value::as_str)
        .map(str::to_string);

    // `replies` is "" when empty, otherwise a Listing.
    let children = match data.get("replies") {
        Some(listing @ Value::Object(_)) => parse_listing(listing, more),
        _ => Vec::new(),
    };
    Some(CommentNode::with_children(message, children))
}

fn parse_listing(listing: &Value, more: &mut Vec<String>) -> Vec<CommentNode> {
    listing
        .pointer("/data/children")
        .and_then(Value::as_array)
        .map(|things| things.iter().filter_map(|t| parse_comment(t, more)).collect())
        .unwrap_or_default()
}

/// Build the comment forest from a `/comments/{id}` response: the first
/// listing holds the post, the second its top-level comments. Ids behind
/// `more` stubs are pushed onto `more`.
fn parse_thread(body: &Value, more: &mut Vec<String>) -> Result<Vec<CommentNode>, AdapterError> {
    let listings = body.as_array().ok_or_else(|| invalid("expected a pair of listings"))?;
    let post = listings
        .first()
        .and_then(|l| l.pointer("/data/children/0/data"))
        .ok_or_else(|| invalid("missing post listing"))?;

    let id = post
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("post without id"))?;
    let created = created_of(post).ok_or_else(|| invalid("post without created_utc"))?;
    let title = post.get("title").and_then(Value::as_str).unwrap_or_default();
    let selftext = post.get("selftext").and_then(Value::as_str).unwrap_or_default();
    let text = if selftext.is_empty() {
        title.to_string()
    } else {
        format!("{title}\n\n{selftext}")
    };

    let root = RawMessage::new(id, author_of(post), created).with_text(text);
    let comments = listings.get(1).map(|l| parse_listing(l, more)).unwrap_or_default();
    Ok(vec![CommentNode::with_children(root, comments)])
}

/// Parse a `/api/morechildren` response. Things come back flat, each naming
/// its parent; the result pairs every comment with its parent's bare id.
fn parse_more_children(
    body: &Value,
    more: &mut Vec<String>,
) -> Result<Vec<(String, CommentNode)>, AdapterError> {
    let things = body
        .pointer("/json/data/things")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("morechildren response without things"))?;
    Ok(things
        .iter()
        .filter_map(|thing| {
            let node = parse_comment(thing, more)?;
            let parent = thing.pointer("/data/parent_id").and_then(Value::as_str)?;
            Some((bare_id(parent).to_string(), node))
        })
        .collect())
}

/// Resolve `pending` stub ids in batches through `fetch_batch`, following
/// stubs that the responses themselves contain, for at most
/// `MAX_MORE_REQUESTS` calls. Expired credentials fail the expansion; any
/// other failure stops it and keeps what was already fetched.
async fn expand_more<F, Fut>(
    mut pending: Vec<String>,
    mut fetch_batch: F,
) -> Result<Vec<(String, CommentNode)>, AdapterError>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Value, AdapterError>>,
{
    let mut grafts = Vec::new();
    let mut requests = 0;
    while !pending.is_empty() {
        if requests == MAX_MORE_REQUESTS {
            tracing::warn!(left = pending.len(), requests, "Stopped expanding Reddit comment stubs");
            break;
        }
        let batch: Vec<String> = pending.drain(..pending.len().min(MORE_BATCH)).collect();
        requests += 1;
        match fetch_batch(batch)
            .await
            .and_then(|body| parse_more_children(&body, &mut pending))
        {
            Ok(found) => grafts.extend(found),
            Err(e @ AdapterError::AuthExpired { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, left = pending.len(), "Reddit comment stub expansion failed");
                break;
            }
        }
    }
    Ok(grafts)
}

/// Attach expanded comments under their parents. Comments whose parent is not
/// in the forest hang off the first root.
fn graft(forest: &mut [CommentNode], grafts: Vec<(String, CommentNode)>) {
    if grafts.is_empty() {
        return;
    }
    let mut pending: HashMap<String, Vec<CommentNode>> = HashMap::new();
    for (parent, node) in grafts {
        pending.entry(parent).or_default().push(node);
    }

    let mut stack: Vec<&mut CommentNode> = forest.iter_mut().collect();
    while let Some(node) = stack.pop() {
        if let Some(children) = pending.remove(&node.message.id) {
            node.children.extend(children);
        }
        stack.extend(node.children.iter_mut());
    }

    if let Some(root) = forest.first_mut() {
        let orphans: Vec<CommentNode> = pending.into_values().flatten().collect();
        if !orphans.is_empty() {
            tracing::debug!(count = orphans.len(), "Expanded Reddit comments without a known parent");
            root.children.extend(orphans);
        }
    }
}

impl RedditAdapter {
    async fn get_json(&self, url: &str, query: &[(&str, &str)], resource: &str) -> Result<Value, AdapterError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.token.expose_secret())
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .query(query)
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(Platform::Reddit, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::from_status(Platform::Reddit, status, resource));
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::from_reqwest(Platform::Reddit, e))
    }
}

#[async_trait]
impl PlatformAdapter for RedditAdapter {
    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    fn supports_range_queries(&self) -> bool {
        false
    }

    async fn fetch_raw(
        &self,
        conversation: &ConversationRef,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<RawBatch, AdapterError> {
        let post_id = conversation.conversation.trim_start_matches("t3_");
        let url = format!("{}/comments/{post_id}", self.base_url);
        let body = self
            .get_json(&url, &[("sort", "best"), ("raw_json", "1")], post_id)
            .await?;

        let mut more = Vec::new();
        let mut forest = parse_thread(&body, &mut more)?;
        if !more.is_empty() {
            let url = format!("{}/api/morechildren", self.base_url);
            let link_id = format!("t3_{post_id}");
            let (url, link_id) = (url.as_str(), link_id.as_str());
            let grafts = expand_more(more, move |batch| {
                async move {
                    let children = batch.join(",");
                    let query = [
                        ("api_type", "json"),
                        ("link_id", link_id),
                        ("children", children.as_str()),
                        ("sort", "best"),
                        ("raw_json", "1"),
                    ];
                    self.get_json(url, &query, link_id).await
                }
            })
            .await?;
            graft(&mut forest, grafts);
        }

        let batch = RawBatch::CommentTree(forest);
        tracing::debug!(post = post_id, count = batch.len(), "Fetched Reddit thread");
        Ok(batch)
    }

    async fn fetch_attachment_bytes(&self, reference: &AttachmentRef) -> Result<AttachmentBytes, AdapterError> {
        Err(AdapterError::NotFound {
            platform: Platform::Reddit,
            resource: reference.location.clone(),
        })
    }
}
