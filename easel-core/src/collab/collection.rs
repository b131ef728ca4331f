//! One replicated, ordered collection: an id sequence plus an id → entity map.
//!
//! The order array and the entry map are separate Yrs types. An id that is
//! in the order but has no entry yet is skipped when deriving the snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use yrs::{Any, Array, ArrayRef, Map, MapRef, Out, ReadTxn, TransactionMut};

use crate::model::{Edge, Node};
use crate::transient::{restore_transient_state, sanitize_for_sync};
use crate::CanvasError;

/// An entity stored in a [`GraphStore`](super::GraphStore) collection.
pub trait Entity: Clone + PartialEq + Serialize + DeserializeOwned {
    fn id(&self) -> &str;

    /// Form written to the document. Must return the same `Arc` when
    /// nothing is stripped.
    fn for_sync(entity: &Arc<Self>) -> Arc<Self> {
        Arc::clone(entity)
    }

    /// Re-attach local-only state after reading from the document.
    fn with_local_state(document: Arc<Self>, _previous: Option<&Self>) -> Arc<Self> {
        document
    }
}

impl Entity for Node {
    fn id(&self) -> &str {
        &self.id
    }

    fn for_sync(entity: &Arc<Self>) -> Arc<Self> {
        sanitize_for_sync(entity)
    }

    fn with_local_state(document: Arc<Self>, previous: Option<&Self>) -> Arc<Self> {
        restore_transient_state(document, previous)
    }
}

impl Entity for Edge {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Writes computed before a transaction is opened, so that a serialization
/// failure never leaves a half-applied transaction behind.
#[derive(Debug, Default)]
pub(crate) struct WritePlan {
    order: Option<Vec<String>>,
    writes: Vec<(String, String)>,
    keep: HashSet<String>,
    reset: bool,
}

/// Reject updater output that cannot be stored as-is.
pub(crate) fn validate<T: Entity>(next: &[Arc<T>]) -> Result<(), String> {
    let mut seen = HashSet::with_capacity(next.len());
    for entity in next {
        let id = entity.id();
        if id.is_empty() {
            return Err("empty id".to_string());
        }
        if !seen.insert(id) {
            return Err(format!("duplicate id {id}"));
        }
    }
    Ok(())
}

pub(crate) struct Collection<T> {
    order: ArrayRef,
    entries: MapRef,
    items: Arc<Vec<Arc<T>>>,
    index: HashMap<String, usize>,
}

impl<T: Entity> Collection<T> {
    pub(crate) fn new(order: ArrayRef, entries: MapRef) -> Self {
        Self {
            order,
            entries,
            items: Arc::new(Vec::new()),
            index: HashMap::new(),
        }
    }

    pub(crate) fn order_ref(&self) -> &ArrayRef {
        &self.order
    }

    pub(crate) fn entries_ref(&self) -> &MapRef {
        &self.entries
    }

    pub(crate) fn items(&self) -> &Arc<Vec<Arc<T>>> {
        &self.items
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Arc<T>> {
        self.index.get(id).and_then(|&i| self.items.get(i))
    }

    /// Minimal write set taking `next` from the current snapshot.
    pub(crate) fn plan(&self, next: &[Arc<T>]) -> Result<WritePlan, CanvasError> {
        let ids_changed = self.items.len() != next.len()
            || self.items.iter().zip(next).any(|(a, b)| a.id() != b.id());

        let mut plan = WritePlan {
            order: ids_changed.then(|| next.iter().map(|e| e.id().to_string()).collect()),
            ..WritePlan::default()
        };

        for entity in next {
            let id = entity.id();
            plan.keep.insert(id.to_string());

            let previous = self.get(id);
            if previous.is_some_and(|p| Arc::ptr_eq(p, entity)) {
                continue;
            }

            let synced = T::for_sync(entity);
            // Transient-only edits change the pointer but not the document.
            if previous.is_some_and(|p| *T::for_sync(p) == *synced) {
                continue;
            }
            plan.writes.push((id.to_string(), serde_json::to_string(&*synced)?));
        }

        Ok(plan)
    }

    /// Write set that clears and rebuilds the whole collection.
    pub(crate) fn plan_reset(next: &[Arc<T>]) -> Result<WritePlan, CanvasError> {
        let mut plan = WritePlan {
            order: Some(next.iter().map(|e| e.id().to_string()).collect()),
            reset: true,
            ..WritePlan::default()
        };
        for entity in next {
            let synced = T::for_sync(entity);
            plan.writes.push((entity.id().to_string(), serde_json::to_string(&*synced)?));
        }
        Ok(plan)
    }

    /// Apply a plan inside an open transaction. Returns whether anything
    /// was written.
    pub(crate) fn apply(&self, txn: &mut TransactionMut, plan: &WritePlan) -> bool {
        let mut wrote = false;

        if plan.reset {
            self.entries.clear(txn);
            wrote = true;
        }

        if let Some(ids) = &plan.order {
            let len = self.order.len(&*txn);
            if len > 0 {
                self.order.remove_range(txn, 0, len);
            }
            for id in ids {
                self.order.push_back(txn, id.clone());
            }
            wrote = true;
        }

        for (id, json) in &plan.writes {
            self.entries.insert(txn, id.clone(), json.clone());
            wrote = true;
        }

        if !plan.reset {
            let stale: Vec<String> = self
                .entries
                .keys(&*txn)
                .filter(|k| !plan.keep.contains(*k))
                .map(str::to_owned)
                .collect();
            for key in stale {
                self.entries.remove(txn, &key);
                wrote = true;
            }
        }

        wrote
    }

    /// Install an optimistic snapshot after a local transaction.
    pub(crate) fn replace(&mut self, next: Vec<Arc<T>>) {
        self.index = next
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id().to_string(), i))
            .collect();
        self.items = Arc::new(next);
    }

    /// Rebuild the snapshot from the document.
    pub(crate) fn rederive<Tx: ReadTxn>(&mut self, txn: &Tx) {
        let next = {
            let ids = self.read_order(txn);
            let mut next = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(entity) = self.read_entry(txn, &id) else {
                    continue;
                };
                let item = match self.get(&id) {
                    Some(previous) => reconcile(entity, previous),
                    None => T::with_local_state(Arc::new(entity), None),
                };
                next.push(item);
            }
            next
        };
        self.replace(next);
    }

    /// Patch changed keys in place through the id → index cache.
    ///
    /// Returns `false` when the change cannot be expressed as an in-place
    /// patch (added or removed entity) and a full re-derivation is needed.
    pub(crate) fn patch<Tx: ReadTxn>(&mut self, txn: &Tx, keys: &[String]) -> bool {
        let mut items: Vec<Arc<T>> = self.items.as_ref().clone();

        for key in keys {
            let Some(&index) = self.index.get(key) else {
                return false;
            };
            let Some(entity) = self.read_entry(txn, key) else {
                return false;
            };
            items[index] = reconcile(entity, &items[index]);
        }

        self.items = Arc::new(items);
        true
    }

    fn read_order<Tx: ReadTxn>(&self, txn: &Tx) -> Vec<String> {
        // Concurrent order rewrites can merge into repeated ids.
        let mut seen = HashSet::new();
        self.order
            .iter(txn)
            .filter_map(|value| match value {
                Out::Any(Any::String(id)) => Some(id.to_string()),
                _ => None,
            })
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    fn read_entry<Tx: ReadTxn>(&self, txn: &Tx, id: &str) -> Option<T> {
        match self.entries.get(txn, id)? {
            Out::Any(Any::String(json)) => match serde_json::from_str(&json) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    log::warn!("Skipping undecodable entry {id}: {e}");
                    None
                }
            },
            _ => None,
        }
    }
}

/// Merge local state and keep the previous pointer when nothing differs.
fn reconcile<T: Entity>(entity: T, previous: &Arc<T>) -> Arc<T> {
    let merged = T::with_local_state(Arc::new(entity), Some(previous));
    if *merged == **previous {
        Arc::clone(previous)
    } else {
        merged
    }
}
