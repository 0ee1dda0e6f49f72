//! Depth-annotated reading order for resolved messages.

use std::collections::HashMap;

use crate::model::Message;

/// One message in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearEntry<'a> {
    pub message: &'a Message,
    /// 0 for a thread root, parent depth + 1 otherwise.
    pub depth: usize,
    /// Set when the message's parent is absent or it sits on a reply cycle.
    pub orphaned: bool,
}

/// Order messages so every reply follows its parent, siblings in
/// `(timestamp, id)` order.
///
/// Messages whose parent is missing are rendered as roots and marked
/// orphaned. Messages that are only reachable through a cycle are emitted
/// last, also as orphaned roots, so every input appears exactly once.
pub fn linearize(messages: &[Message]) -> Vec<LinearEntry<'_>> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(messages.len());
    for (i, m) in messages.iter().enumerate() {
        index.entry(m.id.as_str()).or_insert(i);
    }

    let by_time = |a: &usize, b: &usize| {
        let (ma, mb) = (&messages[*a], &messages[*b]);
        ma.timestamp.cmp(&mb.timestamp).then_with(|| ma.id.cmp(&mb.id))
    };

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); messages.len()];
    let mut roots: Vec<(usize, bool)> = Vec::new();
    for (i, m) in messages.iter().enumerate() {
        match m.parent_id.as_deref() {
            None => roots.push((i, false)),
            Some(p) if p == m.id => roots.push((i, false)),
            Some(p) => match index.get(p) {
                Some(&parent) if parent != i => children[parent].push(i),
                _ => roots.push((i, true)),
            },
        }
    }
    for list in &mut children {
        list.sort_by(by_time);
    }
    roots.sort_by(|a, b| by_time(&a.0, &b.0));

    let mut visited = vec![false; messages.len()];
    let mut out = Vec::with_capacity(messages.len());
    for &(root, orphaned) in &roots {
        emit_subtree(messages, &children, root, orphaned, &mut visited, &mut out);
    }

    let mut leftover: Vec<usize> = (0..messages.len()).filter(|&i| !visited[i]).collect();
    if !leftover.is_empty() {
        tracing::warn!(count = leftover.len(), "Messages on reply cycles rendered as orphans");
        leftover.sort_by(by_time);
        for i in leftover {
            emit_subtree(messages, &children, i, true, &mut visited, &mut out);
        }
    }
    out
}

/// Pre-order walk from `start`, skipping anything already emitted.
fn emit_subtree<'a>(
    messages: &'a [Message],
    children: &[Vec<usize>],
    start: usize,
    orphaned: bool,
    visited: &mut [bool],
    out: &mut Vec<LinearEntry<'a>>,
) {
    let mut stack = vec![(start, 0usize, orphaned)];
    while let Some((i, depth, orphaned)) = stack.pop() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        out.push(LinearEntry {
            message: &messages[i],
            depth,
            orphaned,
        });
        for &child in children[i].iter().rev() {
            if !visited[child] {
                stack.push((child, depth + 1, false));
            }
        }
    }
}
