//! Per-client UI state that must never reach the replicated document.
//!
//! Both functions return the input `Arc` untouched when there is nothing to
//! do. `GraphStore` relies on that: an unchanged pointer means "skip".

use std::sync::Arc;

use crate::model::Node;

/// Data keys that are local to one client session.
pub const TRANSIENT_KEYS: &[&str] = &[
    "is-typing",
    "is-editing",
    "is-active",
    "asset-status",
    "asset-origin",
    "asset-error",
];

#[inline]
pub fn is_transient_key(key: &str) -> bool {
    TRANSIENT_KEYS.contains(&key)
}

/// Strip transient data keys and the `selected` flag.
pub fn sanitize_for_sync(node: &Arc<Node>) -> Arc<Node> {
    let dirty = node.selected.is_some() || node.data.keys().any(|k| is_transient_key(k));
    if !dirty {
        return Arc::clone(node);
    }

    let mut clean = Node::clone(node);
    clean.data.retain(|k, _| !is_transient_key(k));
    clean.selected = None;
    Arc::new(clean)
}

/// Merge local-only state from `previous` onto a node read from the document.
pub fn restore_transient_state(document_node: Arc<Node>, previous: Option<&Node>) -> Arc<Node> {
    let Some(previous) = previous else {
        return document_node;
    };

    let mut restored: Option<Node> = None;

    for key in TRANSIENT_KEYS {
        if let Some(value) = previous.data.get(*key) {
            if document_node.data.get(*key) != Some(value) {
                restored
                    .get_or_insert_with(|| Node::clone(&document_node))
                    .data
                    .insert((*key).to_string(), value.clone());
            }
        }
    }

    if document_node.selected != previous.selected {
        restored
            .get_or_insert_with(|| Node::clone(&document_node))
            .selected = previous.selected;
    }

    restored.map(Arc::new).unwrap_or(document_node)
}
