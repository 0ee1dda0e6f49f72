//! Thread resolution. Turns each platform's native linkage into a uniform
//! `(thread_id, parent_id)` pair per message.
//!
//! Three strategies, selected by [`Linkage`]:
//! - **Explicit thread**: the platform already groups messages; the key is
//!   copied through, falling back to self-as-root.
//! - **Reply chain**: only `reply_to` pointers exist; roots are found by a
//!   bounded walk with a visited set (see [`reply_chain`]).
//! - **Comment tree**: a nested tree is flattened by an iterative depth-first
//!   traversal (see [`tree`]).
//!
//! Anomalies (cycles, dangling parents) are resolved deterministically and
//! logged, never raised.

pub mod linearize;
pub mod reply_chain;
pub mod tree;

pub use linearize::{LinearEntry, linearize};
pub use reply_chain::relink;

use crate::model::Message;
use crate::platforms::{RawBatch, RawMessage};

/// Native reply-linkage shape of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    ExplicitThread,
    ReplyChain,
    CommentTree,
}

/// Resolve thread and parent ids for a raw batch.
///
/// Flat batches are first put in `(timestamp, id)` order so that anomaly
/// fallbacks do not depend on the order the platform returned messages in.
pub fn resolve(batch: RawBatch) -> Vec<Message> {
    match batch {
        RawBatch::ExplicitThread(mut raw) => {
            sort_raw(&mut raw);
            resolve_explicit(raw)
        }
        RawBatch::ReplyChain(mut raw) => {
            sort_raw(&mut raw);
            reply_chain::resolve_reply_chain(raw)
        }
        RawBatch::CommentTree(roots) => tree::flatten(roots),
    }
}

fn sort_raw(raw: &mut [RawMessage]) {
    raw.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

/// Copy explicit thread keys through; messages without one are their own root.
fn resolve_explicit(raw: Vec<RawMessage>) -> Vec<Message> {
    raw.into_iter()
        .map(|m| {
            let key = m
                .thread_key
                .clone()
                .filter(|k| !k.is_empty() && *k != m.id);
            let parent = m
                .reply_to
                .clone()
                .or_else(|| key.clone())
                .filter(|p| *p != m.id);
            let thread_id = key.unwrap_or_else(|| m.id.clone());
            m.into_message(thread_id, parent)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Author;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn raw(id: &str, secs: i64) -> RawMessage {
        RawMessage::new(id, Author::new("u", "User"), at(secs))
    }

    #[test]
    fn explicit_key_is_copied_through() {
        let out = resolve(RawBatch::ExplicitThread(vec![
            raw("root", 0),
            raw("r1", 10).with_thread_key("root"),
            raw("r2", 20).with_thread_key("root"),
        ]));
        assert!(out.iter().all(|m| m.thread_id == "root"));
        assert_eq!(out[0].parent_id, None);
        assert_eq!(out[1].parent_id.as_deref(), Some("root"));
    }

    #[test]
    fn explicit_without_key_is_own_root() {
        let out = resolve(RawBatch::ExplicitThread(vec![raw("solo", 0)]));
        assert_eq!(out[0].thread_id, "solo");
        assert!(out[0].is_root());
    }

    #[test]
    fn explicit_self_key_is_ignored() {
        let out = resolve(RawBatch::ExplicitThread(vec![raw("x", 0).with_thread_key("x")]));
        assert_eq!(out[0].thread_id, "x");
        assert_eq!(out[0].parent_id, None);
    }

    #[test]
    fn explicit_key_survives_missing_root() {
        let out = resolve(RawBatch::ExplicitThread(vec![raw("reply", 5).with_thread_key("gone")]));
        assert_eq!(out[0].thread_id, "gone");
        assert_eq!(out[0].parent_id.as_deref(), Some("gone"));
    }

    #[test]
    fn flat_batches_are_time_ordered() {
        let out = resolve(RawBatch::ReplyChain(vec![raw("b", 20), raw("a", 10), raw("c", 20)]));
        let ids: Vec<_> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
