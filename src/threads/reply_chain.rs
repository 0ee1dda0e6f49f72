//! Reply-chain root resolution.
//!
//! Each message points only at the message it replies to. For every message
//! the chain is walked upward until one of:
//! - the message has no parent (it is the root),
//! - the parent is not in the batch (the last node reached is the root),
//! - a node already visited on this walk comes up again (a cycle; the first
//!   cycle member reached on the walk becomes the root).
//!
//! Walks are memoized, so resolving a whole batch is linear in its size and
//! never recurses.

use std::collections::HashMap;

use crate::model::Message;
use crate::platforms::RawMessage;

/// How a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Root,
    DanglingParent,
    Cycle,
}

#[derive(Debug, Clone, Copy)]
struct Resolution {
    root: usize,
    terminal: Terminal,
}

/// Parent link of one node in the resolver arena.
#[derive(Debug, Clone, Copy)]
enum ParentLink {
    None,
    Present(usize),
    Missing,
}

/// Resolver-internal node. `walk` is the visited marker: the id of the last
/// walk that passed through this node.
#[derive(Debug)]
struct ThreadNode {
    parent: ParentLink,
    walk: usize,
    resolved: Option<Resolution>,
}

/// Resolve the root of every `(id, parent)` pair. Output is index-aligned.
fn resolve_roots(links: &[(&str, Option<&str>)]) -> Vec<Resolution> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(links.len());
    for (i, (id, _)) in links.iter().enumerate() {
        index.entry(*id).or_insert(i);
    }

    let mut nodes: Vec<ThreadNode> = links
        .iter()
        .map(|(id, parent)| {
            let parent = match parent {
                Some(p) if p != id => match index.get(p) {
                    Some(&j) => ParentLink::Present(j),
                    None => ParentLink::Missing,
                },
                _ => ParentLink::None,
            };
            ThreadNode {
                parent,
                walk: usize::MAX,
                resolved: None,
            }
        })
        .collect();

    let mut path = Vec::new();
    for start in 0..nodes.len() {
        if nodes[start].resolved.is_some() {
            continue;
        }
        path.clear();
        let mut current = start;
        let result = loop {
            if let Some(done) = nodes[current].resolved {
                break done;
            }
            if nodes[current].walk == start {
                tracing::warn!(
                    root = links[current].0,
                    from = links[start].0,
                    "Reply cycle detected; using first cycle member reached as thread root"
                );
                break Resolution {
                    root: current,
                    terminal: Terminal::Cycle,
                };
            }
            nodes[current].walk = start;
            path.push(current);
            match nodes[current].parent {
                ParentLink::None => {
                    break Resolution {
                        root: current,
                        terminal: Terminal::Root,
                    };
                }
                ParentLink::Missing => {
                    break Resolution {
                        root: current,
                        terminal: Terminal::DanglingParent,
                    };
                }
                ParentLink::Present(parent) => current = parent,
            }
        };
        if result.terminal == Terminal::DanglingParent && path.len() == 1 {
            tracing::debug!(
                id = links[start].0,
                parent = links[start].1.unwrap_or_default(),
                "Reply parent not in batch"
            );
        }
        for &node in &path {
            nodes[node].resolved = Some(result);
        }
    }

    nodes
        .into_iter()
        .enumerate()
        .map(|(i, n)| {
            n.resolved.unwrap_or(Resolution {
                root: i,
                terminal: Terminal::Root,
            })
        })
        .collect()
}

/// Resolve a batch whose messages carry only `reply_to` pointers.
///
/// `parent_id` is always the immediate `reply_to` (a self-reply counts as none).
pub fn resolve_reply_chain(raw: Vec<RawMessage>) -> Vec<Message> {
    let roots = {
        let links: Vec<(&str, Option<&str>)> = raw
            .iter()
            .map(|m| (m.id.as_str(), m.reply_to.as_deref()))
            .collect();
        resolve_roots(&links)
    };
    let root_ids: Vec<String> = roots.iter().map(|r| raw[r.root].id.clone()).collect();

    raw.into_iter()
        .zip(root_ids)
        .map(|(m, thread_id)| {
            let parent = m.reply_to.clone().filter(|p| *p != m.id);
            m.into_message(thread_id, parent)
        })
        .collect()
}

/// Re-resolve thread roots over an already resolved, merged message set.
///
/// Chains that were cut at chunk boundaries get joined up. When a walk ends at
/// a message whose parent is still absent, that message's existing `thread_id`
/// is kept, since it was computed from a view that could see further.
/// Returns the number of messages whose `thread_id` changed.
pub fn relink(messages: &mut [Message]) -> usize {
    let new_ids: Vec<String> = {
        let links: Vec<(&str, Option<&str>)> = messages
            .iter()
            .map(|m| (m.id.as_str(), m.parent_id.as_deref()))
            .collect();
        resolve_roots(&links)
            .into_iter()
            .map(|r| match r.terminal {
                Terminal::Root | Terminal::Cycle => messages[r.root].id.clone(),
                Terminal::DanglingParent => messages[r.root].thread_id.clone(),
            })
            .collect()
    };

    let mut changed = 0;
    for (message, thread_id) in messages.iter_mut().zip(new_ids) {
        if message.thread_id != thread_id {
            message.thread_id = thread_id;
            changed += 1;
        }
    }
    if changed > 0 {
        tracing::debug!(changed, "Relinked reply chains across chunks");
    }
    changed
}
