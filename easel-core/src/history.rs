//! Linear undo/redo layered above the graph store.
//!
//! CRDT operations are not invertible, so history is kept as pairs of full
//! graph snapshots and never replicated. Replaying an entry writes the
//! historical snapshot back through [`GraphStore::set_graph`], which only
//! touches the entities that actually differ from the live graph.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::collab::GraphStore;
use crate::model::{Edge, Node};
use crate::transient::{restore_transient_state, sanitize_for_sync};

/// Node data keys excluded from time travel (in-flight AI generation).
/// They are carried over from the live graph when a snapshot is replayed.
pub const VOLATILE_KEYS: &[&str] = &["generation-status", "generation-result"];

#[inline]
pub fn is_volatile_key(key: &str) -> bool {
    VOLATILE_KEYS.contains(&key)
}

/// History settings.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum entries per stack; the oldest entry is evicted on overflow.
    pub max_depth: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_depth: 30 }
    }
}

/// Deep, transient-stripped copy of the graph.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanvasSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl CanvasSnapshot {
    pub fn capture(store: &GraphStore) -> Self {
        let nodes = store
            .nodes()
            .iter()
            .map(|node| {
                let mut node = Node::clone(&sanitize_for_sync(node));
                node.data.retain(|k, _| !is_volatile_key(k));
                node
            })
            .collect();
        let edges = store.edges().iter().map(|e| Edge::clone(e)).collect();
        Self { nodes, edges }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub before: CanvasSnapshot,
    pub after: CanvasSnapshot,
    pub label: Option<String>,
}

/// Capability returned by [`UndoRedoManager::begin_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionToken(u64);

struct PendingAction {
    token: ActionToken,
    before: CanvasSnapshot,
    label: Option<String>,
}

pub struct UndoRedoManager {
    config: HistoryConfig,
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
    pending: Option<PendingAction>,
    next_token: u64,
    /// Set while a historical snapshot is written back.
    replaying: bool,
}

impl Default for UndoRedoManager {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl UndoRedoManager {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            pending: None,
            next_token: 1,
            replaying: false,
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Label of the entry `undo` would revert.
    pub fn undo_label(&self) -> Option<&str> {
        self.undo_stack.back().and_then(|e| e.label.as_deref())
    }

    /// Run `mutator` and record its net effect as one entry.
    ///
    /// Returns whether an entry was pushed. A mutator whose result is
    /// structurally equal to the starting graph records nothing.
    pub fn perform_action<F>(&mut self, store: &mut GraphStore, label: Option<&str>, mutator: F) -> bool
    where
        F: FnOnce(&mut GraphStore),
    {
        if self.replaying {
            mutator(store);
            return false;
        }
        let before = CanvasSnapshot::capture(store);
        mutator(store);
        let after = CanvasSnapshot::capture(store);
        self.record(before, after, label.map(str::to_owned))
    }

    /// Start an interactive gesture. Any gesture already open is dropped.
    pub fn begin_action(&mut self, store: &GraphStore, label: Option<&str>) -> ActionToken {
        let token = ActionToken(self.next_token);
        self.next_token += 1;

        if let Some(stale) = self.pending.take() {
            log::debug!("Dropping unfinished action {:?}", stale.token);
        }
        self.pending = Some(PendingAction {
            token,
            before: CanvasSnapshot::capture(store),
            label: label.map(str::to_owned),
        });
        token
    }

    /// Close the gesture opened with `token`. Stale tokens are a no-op.
    pub fn commit_action(&mut self, store: &GraphStore, token: ActionToken) -> bool {
        if self.replaying || self.pending.as_ref().map(|p| p.token) != Some(token) {
            return false;
        }
        let Some(pending) = self.pending.take() else {
            return false;
        };
        let after = CanvasSnapshot::capture(store);
        self.record(pending.before, after, pending.label)
    }

    /// Discard the gesture opened with `token` without recording it.
    pub fn cancel_action(&mut self, token: ActionToken) -> bool {
        if self.pending.as_ref().map(|p| p.token) != Some(token) {
            return false;
        }
        self.pending = None;
        true
    }

    /// Revert the latest entry. A snapshot the store refuses stays on the
    /// undo stack and `false` is returned.
    pub fn undo(&mut self, store: &mut GraphStore) -> bool {
        let Some(entry) = self.undo_stack.pop_back() else {
            return false;
        };
        self.pending = None;
        if !self.replay(store, &entry.before) {
            self.undo_stack.push_back(entry);
            return false;
        }
        push_bounded(&mut self.redo_stack, entry, self.config.max_depth);
        true
    }

    pub fn redo(&mut self, store: &mut GraphStore) -> bool {
        let Some(entry) = self.redo_stack.pop_back() else {
            return false;
        };
        self.pending = None;
        if !self.replay(store, &entry.after) {
            self.redo_stack.push_back(entry);
            return false;
        }
        push_bounded(&mut self.undo_stack, entry, self.config.max_depth);
        true
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.pending = None;
    }

    fn record(&mut self, before: CanvasSnapshot, after: CanvasSnapshot, label: Option<String>) -> bool {
        if before == after {
            return false;
        }
        push_bounded(&mut self.undo_stack, HistoryEntry { before, after, label }, self.config.max_depth);
        self.redo_stack.clear();
        true
    }

    fn replay(&mut self, store: &mut GraphStore, snapshot: &CanvasSnapshot) -> bool {
        self.replaying = true;
        let applied = store.set_graph(
            |live| {
                let live: HashMap<&str, &Arc<Node>> = live.iter().map(|n| (n.id.as_str(), n)).collect();
                snapshot
                    .nodes
                    .iter()
                    .map(|node| match live.get(node.id.as_str()) {
                        Some(current) => merge_live_node(node, current),
                        None => Arc::new(node.clone()),
                    })
                    .collect::<Vec<_>>()
            },
            |live| {
                let live: HashMap<&str, &Arc<Edge>> = live.iter().map(|e| (e.id.as_str(), e)).collect();
                snapshot
                    .edges
                    .iter()
                    .map(|edge| match live.get(edge.id.as_str()) {
                        Some(current) if ***current == *edge => Arc::clone(current),
                        _ => Arc::new(edge.clone()),
                    })
                    .collect::<Vec<_>>()
            },
        );
        if !applied {
            log::warn!("History snapshot could not be applied");
        }
        self.replaying = false;
        applied
    }
}

/// Historical node with volatile and transient state taken from `live`.
/// Returns the live pointer when nothing differs.
fn merge_live_node(historical: &Node, live: &Arc<Node>) -> Arc<Node> {
    let mut node = historical.clone();
    for key in VOLATILE_KEYS {
        if let Some(value) = live.data.get(*key) {
            node.data.insert((*key).to_string(), value.clone());
        }
    }
    let node = restore_transient_state(Arc::new(node), Some(live));
    if *node == **live {
        Arc::clone(live)
    } else {
        node
    }
}

fn push_bounded(stack: &mut VecDeque<HistoryEntry>, entry: HistoryEntry, max_depth: usize) {
    stack.push_back(entry);
    while stack.len() > max_depth.max(1) {
        stack.pop_front();
    }
}
