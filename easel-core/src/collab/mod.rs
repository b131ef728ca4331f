//! CRDT-backed graph store: the single source of truth for canvas content.
//!
//! Local mutations run as one Yrs transaction tagged with the local origin
//! and update the snapshot optimistically. Document events that carry the
//! local tag are our own echo and are dropped; everything else is patched
//! into the snapshot through the id → index cache, or re-derived in full
//! when an order sequence changed.
//!
//! Two concurrent reparents can merge into a parent cycle. The snapshot
//! detaches the lowest id of each cycle from its parent; the document keeps
//! both writes until a later edit of that node replaces them.
//!
//! Order sequences are plain Yrs arrays. A local reorder rewrites the whole
//! array, so two peers reordering concurrently merge into the union of
//! both rewrites; re-derivation keeps the first occurrence of each id.

mod collection;
mod events;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::model::{Edge, Node};
use crate::CanvasError;

use collection::{validate, Collection, WritePlan};
use events::{observe_entries, observe_order, ChangeQueue, CollectionKind, DocChange};

pub use collection::Entity;

const NODE_ORDER: &str = "node-order";
const NODES: &str = "nodes";
const EDGE_ORDER: &str = "edge-order";
const EDGES: &str = "edges";

const LOCAL_ORIGIN: &str = "easel-local";
const REMOTE_ORIGIN: &str = "easel-remote";

/// Read-optimized view of the canvas backed by a Yrs document.
pub struct GraphStore {
    doc: Doc,
    nodes: Collection<Node>,
    edges: Collection<Edge>,
    local_origin: Origin,
    remote_origin: Origin,
    changes: ChangeQueue,
    /// Encoded updates from local transactions, waiting for a transport.
    pending_updates: Vec<Vec<u8>>,
    suppressed_echoes: u64,
    /// Nodes whose parent link is hidden from the snapshot to break a cycle.
    detached: HashSet<String>,
    _subscriptions: Vec<Subscription>,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self::with_doc(Doc::new())
    }

    /// Fixed Yrs client id, for deterministic replicas in tests.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::with_doc(Doc::with_client_id(client_id))
    }

    /// Restore a store from a blob produced by [`GraphStore::encode_state`].
    pub fn from_state(state: &[u8]) -> Result<Self, CanvasError> {
        let mut store = Self::new();
        store.apply_remote_update(state)?;
        Ok(store)
    }

    fn with_doc(doc: Doc) -> Self {
        let nodes = Collection::new(doc.get_or_insert_array(NODE_ORDER), doc.get_or_insert_map(NODES));
        let edges = Collection::new(doc.get_or_insert_array(EDGE_ORDER), doc.get_or_insert_map(EDGES));

        let local_origin = Origin::from(LOCAL_ORIGIN);
        let changes = ChangeQueue::default();
        let subscriptions = vec![
            observe_order(nodes.order_ref(), CollectionKind::Nodes, local_origin.clone(), changes.clone()),
            observe_entries(nodes.entries_ref(), CollectionKind::Nodes, local_origin.clone(), changes.clone()),
            observe_order(edges.order_ref(), CollectionKind::Edges, local_origin.clone(), changes.clone()),
            observe_entries(edges.entries_ref(), CollectionKind::Edges, local_origin.clone(), changes.clone()),
        ];

        Self {
            doc,
            nodes,
            edges,
            local_origin,
            remote_origin: Origin::from(REMOTE_ORIGIN),
            changes,
            pending_updates: Vec::new(),
            suppressed_echoes: 0,
            detached: HashSet::new(),
            _subscriptions: subscriptions,
        }
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Latest node snapshot. Cheap to clone and stable until the next change.
    pub fn get_nodes(&self) -> Arc<Vec<Arc<Node>>> {
        Arc::clone(self.nodes.items())
    }

    pub fn get_edges(&self) -> Arc<Vec<Arc<Edge>>> {
        Arc::clone(self.edges.items())
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        self.nodes.items()
    }

    pub fn edges(&self) -> &[Arc<Edge>] {
        self.edges.items()
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Arc<Edge>> {
        self.edges.get(id)
    }

    /// Edges whose source or target is not in the snapshot.
    pub fn dangling_edges(&self) -> Vec<Arc<Edge>> {
        self.edges
            .items()
            .iter()
            .filter(|e| self.nodes.get(&e.source).is_none() || self.nodes.get(&e.target).is_none())
            .cloned()
            .collect()
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Own-origin events dropped so far.
    pub fn suppressed_echoes(&self) -> u64 {
        self.suppressed_echoes
    }

    // ---------------------------------------------------------------
    // Local mutations
    // ---------------------------------------------------------------

    /// Replace the node list with `updater(current)` in one transaction.
    ///
    /// Returning `None`, duplicate or empty ids, or a containment cycle
    /// through a node whose parent changed leaves the store untouched. Returns whether the update was accepted.
    pub fn set_nodes<F, R>(&mut self, updater: F) -> bool
    where
        F: FnOnce(&[Arc<Node>]) -> R,
        R: Into<Option<Vec<Arc<Node>>>>,
    {
        let Some(next) = self.prepare_nodes(updater) else {
            return false;
        };
        match self.nodes.plan(&next) {
            Ok(plan) => {
                self.commit(Some((plan, next)), None);
                true
            }
            Err(e) => {
                log::warn!("Ignoring node update: {e}");
                false
            }
        }
    }

    pub fn set_edges<F, R>(&mut self, updater: F) -> bool
    where
        F: FnOnce(&[Arc<Edge>]) -> R,
        R: Into<Option<Vec<Arc<Edge>>>>,
    {
        let Some(next) = self.prepare_edges(updater) else {
            return false;
        };
        match self.edges.plan(&next) {
            Ok(plan) => {
                self.commit(None, Some((plan, next)));
                true
            }
            Err(e) => {
                log::warn!("Ignoring edge update: {e}");
                false
            }
        }
    }

    /// Update nodes and edges together in a single transaction.
    pub fn set_graph<FN, RN, FE, RE>(&mut self, nodes: FN, edges: FE) -> bool
    where
        FN: FnOnce(&[Arc<Node>]) -> RN,
        RN: Into<Option<Vec<Arc<Node>>>>,
        FE: FnOnce(&[Arc<Edge>]) -> RE,
        RE: Into<Option<Vec<Arc<Edge>>>>,
    {
        let (Some(next_nodes), Some(next_edges)) = (self.prepare_nodes(nodes), self.prepare_edges(edges)) else {
            return false;
        };
        let plans = self
            .nodes
            .plan(&next_nodes)
            .and_then(|n| self.edges.plan(&next_edges).map(|e| (n, e)));
        match plans {
            Ok((node_plan, edge_plan)) => {
                self.commit(Some((node_plan, next_nodes)), Some((edge_plan, next_edges)));
                true
            }
            Err(e) => {
                log::warn!("Ignoring graph update: {e}");
                false
            }
        }
    }

    /// Replace the whole graph (file load). Clears and rebuilds both order
    /// sequences and both maps in one transaction.
    pub fn set_canvas_state(&mut self, nodes: Vec<Arc<Node>>, edges: Vec<Arc<Edge>>) -> bool {
        let (Some(nodes), Some(edges)) = (self.prepare_nodes(|_| nodes), self.prepare_edges(|_| edges)) else {
            return false;
        };
        let plans = Collection::<Node>::plan_reset(&nodes)
            .and_then(|n| Collection::<Edge>::plan_reset(&edges).map(|e| (n, e)));
        match plans {
            Ok((node_plan, edge_plan)) => {
                self.commit(Some((node_plan, nodes)), Some((edge_plan, edges)));
                true
            }
            Err(e) => {
                log::warn!("Ignoring canvas state: {e}");
                false
            }
        }
    }

    fn prepare_nodes<F, R>(&self, updater: F) -> Option<Vec<Arc<Node>>>
    where
        F: FnOnce(&[Arc<Node>]) -> R,
        R: Into<Option<Vec<Arc<Node>>>>,
    {
        let Some(next) = updater(self.nodes.items()).into() else {
            log::warn!("Node updater returned no list; ignored");
            return None;
        };
        if let Err(reason) = validate(&next).and_then(|()| check_containment(&next, self.nodes.items())) {
            log::warn!("Ignoring malformed node list: {reason}");
            return None;
        }
        Some(next)
    }

    fn prepare_edges<F, R>(&self, updater: F) -> Option<Vec<Arc<Edge>>>
    where
        F: FnOnce(&[Arc<Edge>]) -> R,
        R: Into<Option<Vec<Arc<Edge>>>>,
    {
        let Some(next) = updater(self.edges.items()).into() else {
            log::warn!("Edge updater returned no list; ignored");
            return None;
        };
        if let Err(reason) = validate(&next) {
            log::warn!("Ignoring malformed edge list: {reason}");
            return None;
        }
        Some(next)
    }

    fn commit(
        &mut self,
        nodes: Option<(WritePlan, Vec<Arc<Node>>)>,
        edges: Option<(WritePlan, Vec<Arc<Edge>>)>,
    ) {
        {
            let mut txn = self.doc.transact_mut_with(self.local_origin.clone());
            let mut wrote = false;
            if let Some((plan, _)) = &nodes {
                wrote |= self.nodes.apply(&mut txn, plan);
            }
            if let Some((plan, _)) = &edges {
                wrote |= self.edges.apply(&mut txn, plan);
            }
            if wrote {
                self.pending_updates.push(txn.encode_update_v1());
            }
        }

        if let Some((_, next)) = nodes {
            self.nodes.replace(next);
            if !self.detached.is_empty() {
                // The hidden links may no longer form a cycle.
                self.detached.clear();
                let txn = self.doc.transact();
                self.nodes.rederive(&txn);
            }
            self.detach_cycles();
        }
        if let Some((_, next)) = edges {
            self.edges.replace(next);
        }
        self.process_changes();
    }

    // ---------------------------------------------------------------
    // Replication
    // ---------------------------------------------------------------

    /// Updates produced by local transactions since the last call.
    pub fn take_pending_updates(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending_updates)
    }

    /// Integrate an update from another replica.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<(), CanvasError> {
        let update = Update::decode_v1(update)?;
        {
            let mut txn = self.doc.transact_mut_with(self.remote_origin.clone());
            txn.apply_update(update)
                .map_err(|e| CanvasError::Apply(e.to_string()))?;
        }
        self.process_changes();
        Ok(())
    }

    /// Encoded state vector (sync step 1).
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the holder of `remote_state_vector` is missing (sync step 2).
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, CanvasError> {
        let remote = StateVector::decode_v1(remote_state_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    /// Full document state as an opaque blob.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn process_changes(&mut self) {
        let mut order_changed: HashMap<CollectionKind, bool> = HashMap::new();
        let mut changed_keys: HashMap<CollectionKind, Vec<String>> = HashMap::new();

        for change in self.changes.drain() {
            if change.is_local() {
                self.suppressed_echoes += 1;
                continue;
            }
            match change {
                DocChange::Order { collection, .. } => {
                    order_changed.insert(collection, true);
                }
                DocChange::Entries { collection, keys, .. } => {
                    changed_keys.entry(collection).or_default().extend(keys);
                }
            }
        }

        if order_changed.is_empty() && changed_keys.is_empty() {
            return;
        }

        let node_keys = changed_keys.get(&CollectionKind::Nodes).map(Vec::as_slice).unwrap_or_default();
        let rederive_nodes = order_changed.contains_key(&CollectionKind::Nodes)
            || (!self.detached.is_empty() && !node_keys.is_empty());
        if rederive_nodes {
            self.detached.clear();
        }
        {
            let txn = self.doc.transact();
            refresh(&mut self.nodes, &txn, rederive_nodes, node_keys);
            refresh(
                &mut self.edges,
                &txn,
                order_changed.contains_key(&CollectionKind::Edges),
                changed_keys.get(&CollectionKind::Edges).map(Vec::as_slice).unwrap_or_default(),
            );
        }
        self.detach_cycles();
    }

    /// Clear the parent of the lowest id in every cycle, in the snapshot only.
    fn detach_cycles(&mut self) {
        let cycles = containment_cycles(self.nodes.items());
        if cycles.is_empty() {
            return;
        }
        let lowest: HashSet<String> = cycles.into_iter().filter_map(|c| c.into_iter().min()).collect();
        log::warn!("Detaching {lowest:?} from concurrent containment cycles");

        let next = self
            .nodes
            .items()
            .iter()
            .map(|n| {
                if lowest.contains(&n.id) {
                    let mut detached = Node::clone(n);
                    detached.parent_id = None;
                    Arc::new(detached)
                } else {
                    Arc::clone(n)
                }
            })
            .collect();
        self.nodes.replace(next);
        self.detached.extend(lowest);
    }
}

fn refresh<T: Entity, Tx: ReadTxn>(collection: &mut Collection<T>, txn: &Tx, order_changed: bool, keys: &[String]) {
    if order_changed {
        collection.rederive(txn);
    } else if !keys.is_empty() && !collection.patch(txn, keys) {
        collection.rederive(txn);
    }
}

/// `parent_id` links must form a forest. Only cycles through a node whose
/// parent differs from `current` are rejected; inherited ones are detached
/// by the snapshot.
fn check_containment(next: &[Arc<Node>], current: &[Arc<Node>]) -> Result<(), String> {
    let cycles = containment_cycles(next);
    if cycles.is_empty() {
        return Ok(());
    }
    let before: HashMap<&str, Option<&str>> = current.iter().map(|n| (n.id.as_str(), n.parent_id.as_deref())).collect();
    let after: HashMap<&str, Option<&str>> = next.iter().map(|n| (n.id.as_str(), n.parent_id.as_deref())).collect();

    for cycle in &cycles {
        let introduced = cycle
            .iter()
            .any(|id| before.get(id.as_str()) != after.get(id.as_str()));
        if introduced {
            return Err(format!("containment cycle through {}", cycle[0]));
        }
    }
    Ok(())
}

/// Every parent cycle in `nodes`, as the ids along it.
fn containment_cycles(nodes: &[Arc<Node>]) -> Vec<Vec<String>> {
    let parents: HashMap<&str, &str> = nodes
        .iter()
        .filter_map(|n| n.parent_id.as_deref().map(|p| (n.id.as_str(), p)))
        .collect();

    let mut settled: HashSet<&str> = HashSet::new();
    let mut cycles = Vec::new();
    for node in nodes {
        let mut path: Vec<&str> = Vec::new();
        let mut current = node.id.as_str();
        loop {
            if settled.contains(current) {
                break;
            }
            if let Some(at) = path.iter().position(|id| *id == current) {
                cycles.push(path[at..].iter().map(|id| id.to_string()).collect());
                break;
            }
            path.push(current);
            match parents.get(current) {
                Some(&parent) => current = parent,
                None => break,
            }
        }
        settled.extend(path);
    }
    cycles
}
