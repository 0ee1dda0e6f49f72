//! Comment-tree flattening.

use crate::model::Message;
use crate::platforms::CommentNode;

/// Flatten a forest of comment trees into pre-order messages.
///
/// Every node's `thread_id` is the id of its top-level root; `parent_id` is
/// the enclosing node. Uses an explicit stack so depth is bounded only by
/// memory.
pub fn flatten(roots: Vec<CommentNode>) -> Vec<Message> {
    let mut out = Vec::new();
    // (node, parent id, root id)
    let mut stack: Vec<(CommentNode, Option<String>, Option<String>)> = Vec::with_capacity(roots.len());
    for root in roots.into_iter().rev() {
        stack.push((root, None, None));
    }

    while let Some((node, parent_id, root_id)) = stack.pop() {
        let CommentNode { message, children } = node;
        let id = message.id.clone();
        let thread_id = root_id.unwrap_or_else(|| id.clone());
        let parent_id = parent_id.filter(|p| *p != id);

        for child in children.into_iter().rev() {
            stack.push((child, Some(id.clone()), Some(thread_id.clone())));
        }
        out.push(message.into_message(thread_id, parent_id));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Author;
    use crate::platforms::RawMessage;
    use chrono::Utc;

    fn node(id: &str, children: Vec<CommentNode>) -> CommentNode {
        CommentNode::with_children(RawMessage::new(id, Author::new("u", "U"), Utc::now()), children)
    }

    #[test]
    fn preorder_with_root_and_parent() {
        let out = flatten(vec![node(
            "post",
            vec![node("c1", vec![node("c1a", vec![])]), node("c2", vec![])],
        )]);
        let ids: Vec<_> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["post", "c1", "c1a", "c2"]);
        assert!(out.iter().all(|m| m.thread_id == "post"));
        assert_eq!(out[0].parent_id, None);
        assert_eq!(out[2].parent_id.as_deref(), Some("c1"));
        assert_eq!(out[3].parent_id.as_deref(), Some("post"));
    }

    #[test]
    fn separate_roots_get_separate_threads() {
        let out = flatten(vec![node("p1", vec![node("a", vec![])]), node("p2", vec![node("b", vec![])])]);
        assert_eq!(out.iter().find(|m| m.id == "a").unwrap().thread_id, "p1");
        assert_eq!(out.iter().find(|m| m.id == "b").unwrap().thread_id, "p2");
    }

    #[test]
    fn very_deep_tree_is_flattened_without_recursion() {
        let depth = 50_000;
        let mut tree = node(&format!("n{depth}"), vec![]);
        for i in (0..depth).rev() {
            tree = node(&format!("n{i}"), vec![tree]);
        }
        let out = flatten(vec![tree]);
        assert_eq!(out.len(), depth + 1);
        assert!(out.iter().all(|m| m.thread_id == "n0"));
        assert_eq!(out.last().unwrap().parent_id.as_deref(), Some(format!("n{}", depth - 1).as_str()));
        // Dropping a deeply nested CommentNode recursively would overflow, but
        // flatten consumed it node by node.
    }
}
