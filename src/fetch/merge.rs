//! Merging chunk results into one ordered, duplicate-free list.

use std::collections::HashSet;

use chrono::NaiveDate;

use crate::model::Message;

/// Merge per-segment results.
///
/// Segments are visited in calendar order of their first day, so when a
/// message id appears in more than one segment the earliest segment's copy is
/// kept regardless of which task finished first. The result is sorted by
/// `(timestamp, id)`.
pub fn merge_segments(mut segments: Vec<(NaiveDate, Vec<Message>)>) -> Vec<Message> {
    segments.sort_by_key(|(day, _)| *day);

    let total = segments.iter().map(|(_, m)| m.len()).sum();
    let mut seen: HashSet<String> = HashSet::with_capacity(total);
    let mut merged = Vec::with_capacity(total);
    let mut duplicates = 0usize;
    for (_, messages) in segments {
        for message in messages {
            if seen.insert(message.id.clone()) {
                merged.push(message);
            } else {
                duplicates += 1;
            }
        }
    }
    if duplicates > 0 {
        tracing::debug!(duplicates, "Dropped duplicate messages across chunks");
    }

    merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    merged
}
