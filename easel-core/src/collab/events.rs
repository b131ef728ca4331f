//! Document change events, queued by Yrs observers and drained by the store.
//!
//! Observers run inside the transaction commit, so they only record what
//! changed and whether the transaction carried our local origin tag. The
//! store processes the queue once the transaction has been dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use yrs::{ArrayRef, MapRef, Observable, Origin, Subscription};

/// Which replicated collection an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum CollectionKind {
    Nodes,
    Edges,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DocChange {
    /// The order sequence changed. Every index may have shifted.
    Order { collection: CollectionKind, local: bool },
    /// Map entries were inserted, updated or removed.
    Entries {
        collection: CollectionKind,
        keys: Vec<String>,
        local: bool,
    },
}

impl DocChange {
    pub(crate) fn is_local(&self) -> bool {
        match self {
            DocChange::Order { local, .. } | DocChange::Entries { local, .. } => *local,
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct ChangeQueue(Arc<Mutex<VecDeque<DocChange>>>);

impl ChangeQueue {
    fn push(&self, change: DocChange) {
        let mut queue = self.0.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(change);
    }

    pub(crate) fn drain(&self) -> Vec<DocChange> {
        let mut queue = self.0.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }
}

pub(crate) fn observe_order(
    order: &ArrayRef,
    collection: CollectionKind,
    local_origin: Origin,
    queue: ChangeQueue,
) -> Subscription {
    order.observe(move |txn, _event| {
        let local = txn.origin() == Some(&local_origin);
        queue.push(DocChange::Order { collection, local });
    })
}

pub(crate) fn observe_entries(
    entries: &MapRef,
    collection: CollectionKind,
    local_origin: Origin,
    queue: ChangeQueue,
) -> Subscription {
    entries.observe(move |txn, event| {
        let local = txn.origin() == Some(&local_origin);
        let keys = event.keys(txn).keys().map(|k| k.to_string()).collect();
        queue.push(DocChange::Entries {
            collection,
            keys,
            local,
        });
    })
}
