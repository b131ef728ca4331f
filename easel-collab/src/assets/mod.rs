//! Chunked asset transfer over the file-transfer channel.
//!
//! Nodes reference binary assets by `data["asset-path"]`; the bytes live
//! outside the document. A peer missing an asset asks for it by path:
//!
//! ```text
//! requester                              owner
//!    │ ── AssetRequest { path } ──────────► │
//!    │ ◄── AssetStart { id, size, chunks } ─ │
//!    │ ◄── AssetChunk { id, 0, lz4 } ─────── │
//!    │ ◄── AssetChunk { id, n, lz4 } ─────── │
//!    │ ◄── AssetComplete { id } ──────────── │
//!    │          or AssetFailed { id, path, error }
//! ```
//!
//! Progress is surfaced on the referencing nodes through the transient
//! keys `asset-status` (`ready` | `downloading` | `error`), `asset-error`
//! and `asset-origin` (`local` | `remote`), so it never replicates.

mod store;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use easel_core::{GraphStore, Node};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::protocol::{Envelope, MessageKind, ProtocolError};
use crate::transport::{ChannelEvent, DataChannelTransport, HandlerId, Inbox};

pub use store::{mime_type_for, Asset, AssetStore, DirectoryAssetStore, MemoryAssetStore};

pub const STATUS_KEY: &str = "asset-status";
pub const ERROR_KEY: &str = "asset-error";
pub const ORIGIN_KEY: &str = "asset-origin";

/// Finished transfer records kept for inspection; older ones are dropped.
pub const MAX_FINISHED_TRANSFERS: usize = 64;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid asset path: {0}")]
    InvalidPath(String),
    #[error("Asset not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Decompression failed: {0}")]
    Decompress(String),
    #[error("Corrupt transfer: {0}")]
    Corrupt(String),
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssetMessage {
    Request {
        path: String,
    },
    Start {
        transfer_id: Uuid,
        path: String,
        name: String,
        mime_type: String,
        size: u64,
        chunk_count: u32,
    },
    Chunk {
        transfer_id: Uuid,
        index: u32,
        /// LZ4 block with the uncompressed size prepended.
        data: Vec<u8>,
    },
    Complete {
        transfer_id: Uuid,
    },
    Failed {
        transfer_id: Uuid,
        path: String,
        error: String,
    },
}

impl AssetMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            AssetMessage::Request { .. } => MessageKind::AssetRequest,
            AssetMessage::Start { .. } => MessageKind::AssetStart,
            AssetMessage::Chunk { .. } => MessageKind::AssetChunk,
            AssetMessage::Complete { .. } => MessageKind::AssetComplete,
            AssetMessage::Failed { .. } => MessageKind::AssetFailed,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        Envelope::with_payload(self.kind(), self)
    }

    /// Decode, rejecting a payload that disagrees with the envelope kind.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let message: AssetMessage = envelope.payload_as()?;
        if message.kind() != envelope.kind {
            return Err(ProtocolError::UnexpectedKind(envelope.kind));
        }
        Ok(message)
    }
}

// ───────────────────────────────────────────────────────────────────
// Transfer records
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub asset_path: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub chunk_count: u32,
    pub received_chunks: u32,
    pub status: TransferStatus,
    /// Reassembled bytes of an incoming transfer.
    pub payload: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl TransferRecord {
    fn fail(&mut self, reason: impl Into<String>) {
        self.status = TransferStatus::Failed;
        self.payload = None;
        self.error = Some(reason.into());
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

/// Requests missing assets, serves local ones, and mirrors transfer
/// progress onto the nodes that reference them.
pub struct AssetTransferManager<S: AssetStore> {
    store: S,
    transport: DataChannelTransport,
    channel: String,
    chunk_size: usize,
    /// Paths with a request in flight.
    pending_requests: HashSet<String>,
    transfers: HashMap<Uuid, TransferRecord>,
    /// Terminal transfers already acted upon.
    processed: HashSet<Uuid>,
    /// `processed` in completion order, oldest first.
    finished: VecDeque<Uuid>,
    /// Last failure per path, until released or retried.
    failures: HashMap<String, String>,
    /// Paths whose bytes arrived from a peer.
    received_paths: HashSet<String>,
    inbox: Inbox<Envelope>,
    handler: HandlerId,
}

impl<S: AssetStore> AssetTransferManager<S> {
    pub fn new(store: S, transport: DataChannelTransport, config: &CollabConfig) -> Self {
        let inbox = Inbox::default();
        let sink = inbox.clone();
        let handler = transport.set_channel_handler(&config.file_channel, move |event| {
            if let ChannelEvent::Message(envelope) = event {
                if envelope.kind.is_asset() {
                    sink.push(envelope.clone());
                }
            }
        });

        Self {
            store,
            transport,
            channel: config.file_channel.clone(),
            chunk_size: config.asset_chunk_size.max(1),
            pending_requests: HashSet::new(),
            transfers: HashMap::new(),
            processed: HashSet::new(),
            finished: VecDeque::new(),
            failures: HashMap::new(),
            received_paths: HashSet::new(),
            inbox,
            handler,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.pending_requests.contains(path)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_requests.len()
    }

    pub fn transfer(&self, id: &Uuid) -> Option<&TransferRecord> {
        self.transfers.get(id)
    }

    pub fn transfers(&self) -> impl Iterator<Item = &TransferRecord> {
        self.transfers.values()
    }

    pub fn failure(&self, path: &str) -> Option<&str> {
        self.failures.get(path).map(String::as_str)
    }

    /// Reconcile asset status on every node with the local store, asking
    /// peers for anything missing. Returns whether any node changed.
    pub fn sync_nodes(&mut self, graph: &mut GraphStore) -> bool {
        let mut referenced = HashSet::new();
        let mut to_request = Vec::new();
        let mut changed = false;

        let next: Vec<Arc<Node>> = graph
            .nodes()
            .iter()
            .map(|node| {
                let Some(path) = node.asset_path() else {
                    return clear_status(node, &mut changed);
                };
                referenced.insert(path.to_string());

                let (status, error, origin) = if self.store.contains(path) {
                    let origin = if self.received_paths.contains(path) { "remote" } else { "local" };
                    ("ready", None, Some(origin))
                } else if let Some(reason) = self.failures.get(path) {
                    ("error", Some(reason.clone()), None)
                } else {
                    if !self.pending_requests.contains(path) && !to_request.contains(&path.to_string()) {
                        to_request.push(path.to_string());
                    }
                    ("downloading", None, None)
                };
                with_status(node, status, error, origin, &mut changed)
            })
            .collect();

        for path in &referenced {
            if self.store.contains(path) {
                self.release_asset_request(path);
            }
        }
        let orphaned: Vec<String> = self
            .pending_requests
            .iter()
            .chain(self.failures.keys())
            .filter(|p| !referenced.contains(*p))
            .cloned()
            .collect();
        for path in orphaned {
            self.release_asset_request(&path);
            self.failures.remove(&path);
        }

        for path in to_request {
            self.request(&path);
        }

        changed && graph.set_nodes(|_| next)
    }

    /// Forget the outstanding request for `path`. Safe to repeat.
    pub fn release_asset_request(&mut self, path: &str) -> bool {
        let released = self.pending_requests.remove(path);
        if released {
            log::debug!("Released asset request for {path}");
        }
        released
    }

    /// Clear a failure so the next [`sync_nodes`](Self::sync_nodes) asks again.
    pub fn retry_asset(&mut self, path: &str) -> bool {
        self.release_asset_request(path);
        self.failures.remove(path).is_some()
    }

    /// Handle everything received on the file channel, then refresh node
    /// status. Returns the number of messages handled.
    pub fn process(&mut self, graph: &mut GraphStore) -> usize {
        let envelopes = self.inbox.drain();
        let handled = envelopes.len();

        for envelope in envelopes {
            match AssetMessage::from_envelope(&envelope) {
                Ok(message) => self.handle(message),
                Err(e) => log::warn!("Ignoring malformed asset message: {e}"),
            }
        }

        let terminal: Vec<TransferRecord> = self
            .transfers
            .values()
            .filter(|r| {
                r.direction == TransferDirection::Incoming
                    && r.status.is_terminal()
                    && !self.processed.contains(&r.id)
            })
            .cloned()
            .collect();
        for record in terminal {
            match record.status {
                TransferStatus::Completed => {
                    if let Err(e) = self.complete_transfer(&record) {
                        log::warn!("Could not store {}: {e}", record.asset_path);
                        self.finish(record.id);
                        self.pending_requests.remove(&record.asset_path);
                        self.failures.insert(record.asset_path.clone(), e.to_string());
                    }
                }
                _ => self.fail_transfer(&record),
            }
            if let Some(stored) = self.transfers.get_mut(&record.id) {
                stored.payload = None;
            }
        }

        self.sync_nodes(graph);
        handled
    }

    /// Register a completed incoming transfer's bytes. Returns `Ok(false)`
    /// when the record was already handled or is not a completed download.
    pub fn complete_transfer(&mut self, record: &TransferRecord) -> Result<bool, AssetError> {
        if record.direction != TransferDirection::Incoming
            || record.status != TransferStatus::Completed
            || self.processed.contains(&record.id)
        {
            return Ok(false);
        }
        let bytes = record
            .payload
            .clone()
            .ok_or_else(|| AssetError::Corrupt(format!("transfer {} has no payload", record.id)))?;
        let asset = Asset {
            name: record.name.clone(),
            mime_type: record.mime_type.clone(),
            bytes,
        };
        self.store.store(&record.asset_path, &asset)?;
        self.finish(record.id);
        self.pending_requests.remove(&record.asset_path);
        self.failures.remove(&record.asset_path);
        self.received_paths.insert(record.asset_path.clone());
        log::info!("Received asset {} ({} bytes)", record.asset_path, record.size);
        Ok(true)
    }

    fn fail_transfer(&mut self, record: &TransferRecord) {
        if !self.finish(record.id) {
            return;
        }
        let reason = record.error.clone().unwrap_or_else(|| "transfer failed".to_string());
        log::warn!("Asset transfer for {} failed: {reason}", record.asset_path);
        self.pending_requests.remove(&record.asset_path);
        self.failures.insert(record.asset_path.clone(), reason);
    }

    fn request(&mut self, path: &str) {
        let message = AssetMessage::Request { path: path.to_string() };
        if self.send(&message) {
            log::debug!("Requested asset {path}");
            self.pending_requests.insert(path.to_string());
        }
    }

    fn handle(&mut self, message: AssetMessage) {
        match message {
            AssetMessage::Request { path } => self.serve(&path),
            AssetMessage::Start {
                transfer_id,
                path,
                name,
                mime_type,
                size,
                chunk_count,
            } => {
                if !self.pending_requests.contains(&path) {
                    log::debug!("Ignoring unrequested transfer of {path}");
                    return;
                }
                let record = TransferRecord {
                    id: transfer_id,
                    direction: TransferDirection::Incoming,
                    asset_path: path,
                    name,
                    mime_type,
                    size,
                    chunk_count,
                    received_chunks: 0,
                    status: TransferStatus::InProgress,
                    payload: Some(Vec::new()),
                    error: None,
                };
                self.transfers.entry(transfer_id).or_insert(record);
            }
            AssetMessage::Chunk { transfer_id, index, data } => {
                let Some(record) = self.transfers.get_mut(&transfer_id) else {
                    return;
                };
                if record.status != TransferStatus::InProgress {
                    return;
                }
                if let Err(e) = append_chunk(record, index, &data) {
                    record.fail(e.to_string());
                }
            }
            AssetMessage::Complete { transfer_id } => {
                let Some(record) = self.transfers.get_mut(&transfer_id) else {
                    return;
                };
                if record.status != TransferStatus::InProgress {
                    return;
                }
                let received = record.payload.as_ref().map_or(0, Vec::len) as u64;
                if record.received_chunks != record.chunk_count || received != record.size {
                    record.fail(format!(
                        "incomplete transfer: {}/{} chunks, {received}/{} bytes",
                        record.received_chunks, record.chunk_count, record.size
                    ));
                } else {
                    record.status = TransferStatus::Completed;
                }
            }
            AssetMessage::Failed { transfer_id, path, error } => {
                let record = self.transfers.entry(transfer_id).or_insert_with(|| TransferRecord {
                    id: transfer_id,
                    direction: TransferDirection::Incoming,
                    asset_path: path,
                    name: String::new(),
                    mime_type: String::new(),
                    size: 0,
                    chunk_count: 0,
                    received_chunks: 0,
                    status: TransferStatus::Pending,
                    payload: None,
                    error: None,
                });
                if !record.status.is_terminal() {
                    record.fail(error);
                }
            }
        }
    }

    /// Answer a request: Start, every chunk, Complete. Or Failed.
    fn serve(&mut self, path: &str) {
        let transfer_id = Uuid::new_v4();
        let asset = match self.store.load(path) {
            Ok(Some(asset)) => asset,
            Ok(None) => return self.refuse(transfer_id, path, AssetError::NotFound(path.to_string())),
            Err(e) => return self.refuse(transfer_id, path, e),
        };

        let chunks: Vec<&[u8]> = asset.bytes.chunks(self.chunk_size).collect();
        let mut record = TransferRecord {
            id: transfer_id,
            direction: TransferDirection::Outgoing,
            asset_path: path.to_string(),
            name: asset.name.clone(),
            mime_type: asset.mime_type.clone(),
            size: asset.bytes.len() as u64,
            chunk_count: chunks.len() as u32,
            received_chunks: 0,
            status: TransferStatus::InProgress,
            payload: None,
            error: None,
        };

        let start = AssetMessage::Start {
            transfer_id,
            path: path.to_string(),
            name: asset.name.clone(),
            mime_type: asset.mime_type.clone(),
            size: record.size,
            chunk_count: record.chunk_count,
        };
        let mut ok = self.send(&start);
        for (index, chunk) in chunks.iter().enumerate() {
            if !ok {
                break;
            }
            ok = self.send(&AssetMessage::Chunk {
                transfer_id,
                index: index as u32,
                data: lz4_flex::compress_prepend_size(chunk),
            });
        }
        if ok {
            ok = self.send(&AssetMessage::Complete { transfer_id });
        }

        if ok {
            record.status = TransferStatus::Completed;
            log::info!("Sent asset {path} ({} bytes, {} chunks)", record.size, record.chunk_count);
        } else {
            record.fail("channel closed during send");
        }
        self.transfers.insert(transfer_id, record);
        self.finish(transfer_id);
    }

    /// Mark a terminal transfer handled, evicting the oldest finished
    /// records past [`MAX_FINISHED_TRANSFERS`]. Returns `false` if `id` was
    /// already handled.
    fn finish(&mut self, id: Uuid) -> bool {
        if !self.processed.insert(id) {
            return false;
        }
        self.finished.push_back(id);
        while self.finished.len() > MAX_FINISHED_TRANSFERS {
            if let Some(oldest) = self.finished.pop_front() {
                self.processed.remove(&oldest);
                self.transfers.remove(&oldest);
            }
        }
        true
    }

    fn refuse(&mut self, transfer_id: Uuid, path: &str, error: AssetError) {
        log::debug!("Cannot serve {path}: {error}");
        self.send(&AssetMessage::Failed {
            transfer_id,
            path: path.to_string(),
            error: error.to_string(),
        });
    }

    fn send(&self, message: &AssetMessage) -> bool {
        match message.to_envelope() {
            Ok(envelope) => self.transport.send_envelope(&self.channel, &envelope),
            Err(e) => {
                log::warn!("Failed to encode {:?}: {e}", message.kind());
                false
            }
        }
    }
}

impl<S: AssetStore> Drop for AssetTransferManager<S> {
    fn drop(&mut self) {
        self.transport.clear_channel_handler(self.handler);
    }
}

fn append_chunk(record: &mut TransferRecord, index: u32, data: &[u8]) -> Result<(), AssetError> {
    if index != record.received_chunks {
        return Err(AssetError::Corrupt(format!(
            "chunk {index} arrived, expected {}",
            record.received_chunks
        )));
    }
    let payload = record.payload.get_or_insert_with(Vec::new);
    let remaining = record.size.saturating_sub(payload.len() as u64);

    // Checked before decompressing; the prefix decides the allocation.
    let declared = data
        .get(..4)
        .and_then(|prefix| <[u8; 4]>::try_from(prefix).ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| AssetError::Decompress("chunk shorter than its size prefix".into()))?;
    if u64::from(declared) > remaining {
        return Err(AssetError::Corrupt(format!(
            "chunk {index} declares {declared} bytes, {remaining} of {} remain",
            record.size
        )));
    }

    let bytes = lz4_flex::decompress_size_prepended(data).map_err(|e| AssetError::Decompress(e.to_string()))?;
    if bytes.len() as u64 > remaining {
        return Err(AssetError::Corrupt(format!("more than {} bytes received", record.size)));
    }
    payload.extend_from_slice(&bytes);
    record.received_chunks += 1;
    Ok(())
}

fn clear_status(node: &Arc<Node>, changed: &mut bool) -> Arc<Node> {
    if ![STATUS_KEY, ERROR_KEY, ORIGIN_KEY].iter().any(|k| node.data.contains_key(*k)) {
        return Arc::clone(node);
    }
    *changed = true;
    let mut cleared = Node::clone(node);
    for key in [STATUS_KEY, ERROR_KEY, ORIGIN_KEY] {
        cleared.data.remove(key);
    }
    Arc::new(cleared)
}

/// `node` with the given asset status, reusing it when nothing differs.
fn with_status(
    node: &Arc<Node>,
    status: &str,
    error: Option<String>,
    origin: Option<&str>,
    changed: &mut bool,
) -> Arc<Node> {
    let wanted: [(&str, Option<Value>); 3] = [
        (STATUS_KEY, Some(Value::from(status))),
        (ERROR_KEY, error.map(Value::from)),
        (ORIGIN_KEY, origin.map(Value::from)),
    ];
    if wanted.iter().all(|(k, v)| node.data.get(*k) == v.as_ref()) {
        return Arc::clone(node);
    }
    *changed = true;
    let mut updated = Node::clone(node);
    for (key, value) in wanted {
        match value {
            Some(value) => updated.data.insert(key.to_string(), value),
            None => updated.data.remove(key),
        };
    }
    Arc::new(updated)
}

#[cfg(test)]
mod tests {
    use easel_core::model::ASSET_PATH_KEY;
    use easel_core::{NodeType, Position};

    use super::*;
    use crate::rtc::ChannelState;
    use crate::transport::testing::{linked_transports, RecordingChannel};

    fn image(id: &str, path: &str) -> Arc<Node> {
        Arc::new(Node::with_id(id, NodeType::Image, Position::ORIGIN).with_data(ASSET_PATH_KEY, path))
    }

    fn status(graph: &GraphStore, id: &str) -> Option<String> {
        graph
            .node(id)
            .and_then(|n| n.data.get(STATUS_KEY))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    fn small_chunks() -> CollabConfig {
        CollabConfig {
            asset_chunk_size: 4,
            ..CollabConfig::local()
        }
    }

    fn pair(owner: MemoryAssetStore) -> (AssetTransferManager<MemoryAssetStore>, AssetTransferManager<MemoryAssetStore>) {
        let config = small_chunks();
        let (a, b) = linked_transports(&["file-transfer"]);
        (
            AssetTransferManager::new(owner, a, &config),
            AssetTransferManager::new(MemoryAssetStore::new(), b, &config),
        )
    }

    fn run(
        owner: &mut AssetTransferManager<MemoryAssetStore>,
        owner_graph: &mut GraphStore,
        requester: &mut AssetTransferManager<MemoryAssetStore>,
        requester_graph: &mut GraphStore,
    ) {
        for _ in 0..3 {
            owner.process(owner_graph);
            requester.process(requester_graph);
        }
    }

    #[test]
    fn test_local_asset_is_ready() {
        let mut store = MemoryAssetStore::new();
        store.insert("cat.png", Asset::from_path("cat.png", vec![1, 2, 3]));
        let mut manager = AssetTransferManager::new(store, DataChannelTransport::new(), &small_chunks());
        let mut graph = GraphStore::new();
        graph.set_nodes(|_| vec![image("n", "cat.png")]);

        assert!(manager.sync_nodes(&mut graph));
        assert_eq!(status(&graph, "n").as_deref(), Some("ready"));
        assert_eq!(graph.node("n").unwrap().data.get(ORIGIN_KEY), Some(&Value::from("local")));
        assert_eq!(manager.pending_requests(), 0);
        assert!(!manager.sync_nodes(&mut graph));
    }

    #[test]
    fn test_status_never_reaches_document() {
        let mut manager = AssetTransferManager::new(MemoryAssetStore::new(), DataChannelTransport::new(), &small_chunks());
        let mut graph = GraphStore::new();
        graph.set_nodes(|_| vec![image("n", "cat.png")]);
        graph.take_pending_updates();

        manager.sync_nodes(&mut graph);
        assert_eq!(status(&graph, "n").as_deref(), Some("downloading"));
        assert!(graph.take_pending_updates().is_empty());

        let replica = GraphStore::from_state(&graph.encode_state()).unwrap();
        assert!(replica.node("n").unwrap().data.get(STATUS_KEY).is_none());
    }

    #[test]
    fn test_requests_once_per_path() {
        let channel = RecordingChannel::new("file-transfer", ChannelState::Open);
        let transport = DataChannelTransport::new();
        transport.attach_channel(channel.clone());
        let mut manager = AssetTransferManager::new(MemoryAssetStore::new(), transport, &small_chunks());
        let mut graph = GraphStore::new();
        graph.set_nodes(|_| vec![image("a", "shared.png"), image("b", "shared.png")]);

        manager.sync_nodes(&mut graph);
        manager.sync_nodes(&mut graph);

        let sent = channel.sent_envelopes();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            AssetMessage::from_envelope(&sent[0]).unwrap(),
            AssetMessage::Request { path: "shared.png".into() }
        );
        assert!(manager.is_pending("shared.png"));
    }

    #[test]
    fn test_transfer_end_to_end() {
        let bytes: Vec<u8> = (0..=20).collect();
        let mut owner_store = MemoryAssetStore::new();
        owner_store.insert("chart.png", Asset::from_path("chart.png", bytes.clone()));
        let (mut owner, mut requester) = pair(owner_store);
        let mut owner_graph = GraphStore::new();
        let mut graph = GraphStore::new();
        graph.set_nodes(|_| vec![image("n", "chart.png")]);

        requester.sync_nodes(&mut graph);
        assert_eq!(status(&graph, "n").as_deref(), Some("downloading"));
        run(&mut owner, &mut owner_graph, &mut requester, &mut graph);

        assert_eq!(status(&graph, "n").as_deref(), Some("ready"));
        assert_eq!(graph.node("n").unwrap().data.get(ORIGIN_KEY), Some(&Value::from("remote")));
        let stored = requester.store().load("chart.png").unwrap().unwrap();
        assert_eq!(stored.bytes, bytes);
        assert_eq!(stored.mime_type, "image/png");
        assert!(!requester.is_pending("chart.png"));

        let outgoing: Vec<_> = owner.transfers().collect();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].direction, TransferDirection::Outgoing);
        assert_eq!(outgoing[0].chunk_count, 6);
        assert_eq!(outgoing[0].status, TransferStatus::Completed);
    }

    #[test]
    fn test_missing_asset_marks_error() {
        let (mut owner, mut requester) = pair(MemoryAssetStore::new());
        let mut owner_graph = GraphStore::new();
        let mut graph = GraphStore::new();
        graph.set_nodes(|_| vec![image("n", "gone.png")]);

        requester.sync_nodes(&mut graph);
        run(&mut owner, &mut owner_graph, &mut requester, &mut graph);

        assert_eq!(status(&graph, "n").as_deref(), Some("error"));
        let reason = graph.node("n").unwrap().data.get(ERROR_KEY).and_then(Value::as_str).unwrap();
        assert!(reason.contains("gone.png"));
        assert!(!requester.is_pending("gone.png"));

        // Not retried automatically.
        requester.sync_nodes(&mut graph);
        assert!(!requester.is_pending("gone.png"));

        assert!(requester.retry_asset("gone.png"));
        requester.sync_nodes(&mut graph);
        assert!(requester.is_pending("gone.png"));
    }

    #[test]
    fn test_completed_transfer_registers_once() {
        let mut manager = AssetTransferManager::new(MemoryAssetStore::new(), DataChannelTransport::new(), &small_chunks());
        let record = TransferRecord {
            id: Uuid::new_v4(),
            direction: TransferDirection::Incoming,
            asset_path: "x.png".into(),
            name: "x.png".into(),
            mime_type: "image/png".into(),
            size: 2,
            chunk_count: 1,
            received_chunks: 1,
            status: TransferStatus::Completed,
            payload: Some(vec![9, 9]),
            error: None,
        };

        assert!(manager.complete_transfer(&record).unwrap());
        assert!(!manager.complete_transfer(&record).unwrap());
        assert_eq!(manager.store().len(), 1);
    }

    #[test]
    fn test_out_of_order_chunk_fails_transfer() {
        let mut record = TransferRecord {
            id: Uuid::new_v4(),
            direction: TransferDirection::Incoming,
            asset_path: "x.png".into(),
            name: String::new(),
            mime_type: String::new(),
            size: 8,
            chunk_count: 2,
            received_chunks: 0,
            status: TransferStatus::InProgress,
            payload: Some(Vec::new()),
            error: None,
        };
        let chunk = lz4_flex::compress_prepend_size(&[1, 2, 3, 4]);
        assert!(matches!(append_chunk(&mut record, 1, &chunk), Err(AssetError::Corrupt(_))));
        append_chunk(&mut record, 0, &chunk).unwrap();
        assert_eq!(record.received_chunks, 1);
        assert!(matches!(append_chunk(&mut record, 1, b"ju"), Err(AssetError::Decompress(_))));
    }

    #[test]
    fn test_oversized_chunk_prefix_is_rejected() {
        let mut record = TransferRecord {
            id: Uuid::new_v4(),
            direction: TransferDirection::Incoming,
            asset_path: "x.png".into(),
            name: String::new(),
            mime_type: String::new(),
            size: 8,
            chunk_count: 2,
            received_chunks: 0,
            status: TransferStatus::InProgress,
            payload: Some(Vec::new()),
            error: None,
        };
        append_chunk(&mut record, 0, &lz4_flex::compress_prepend_size(&[1, 2, 3, 4])).unwrap();

        // A prefix claiming ~1.8 GB never reaches the decompressor.
        assert!(matches!(append_chunk(&mut record, 1, b"junk"), Err(AssetError::Corrupt(_))));

        let one_too_many = lz4_flex::compress_prepend_size(&[5, 6, 7, 8, 9]);
        assert!(matches!(append_chunk(&mut record, 1, &one_too_many), Err(AssetError::Corrupt(_))));
        assert_eq!(record.payload.as_deref(), Some(&[1, 2, 3, 4][..]));

        append_chunk(&mut record, 1, &lz4_flex::compress_prepend_size(&[5, 6, 7, 8])).unwrap();
        assert_eq!(record.received_chunks, 2);
    }

    #[test]
    fn test_finished_transfers_are_bounded() {
        let channel = RecordingChannel::new("file-transfer", ChannelState::Open);
        let transport = DataChannelTransport::new();
        transport.attach_channel(channel);
        let mut store = MemoryAssetStore::new();
        store.insert("logo.png", Asset::from_path("logo.png", vec![7; 10]));
        let mut owner = AssetTransferManager::new(store, transport, &small_chunks());

        for _ in 0..MAX_FINISHED_TRANSFERS + 20 {
            owner.handle(AssetMessage::Request { path: "logo.png".into() });
        }
        assert_eq!(owner.transfers().count(), MAX_FINISHED_TRANSFERS);
        assert!(owner.transfers().all(|r| r.status == TransferStatus::Completed));

        // Spurious failures for unknown ids are bounded the same way.
        for _ in 0..MAX_FINISHED_TRANSFERS + 5 {
            owner.handle(AssetMessage::Failed {
                transfer_id: Uuid::new_v4(),
                path: "other.png".into(),
                error: "nope".into(),
            });
        }
        owner.process(&mut GraphStore::new());
        assert_eq!(owner.transfers().count(), MAX_FINISHED_TRANSFERS);
        assert_eq!(owner.processed.len(), MAX_FINISHED_TRANSFERS);
    }

    #[test]
    fn test_deleted_node_releases_request() {
        let channel = RecordingChannel::new("file-transfer", ChannelState::Open);
        let transport = DataChannelTransport::new();
        transport.attach_channel(channel);
        let mut manager = AssetTransferManager::new(MemoryAssetStore::new(), transport, &small_chunks());
        let mut graph = GraphStore::new();
        graph.set_nodes(|_| vec![image("n", "big.png"), Arc::new(Node::with_id("t", NodeType::Text, Position::ORIGIN))]);

        manager.sync_nodes(&mut graph);
        assert!(manager.is_pending("big.png"));

        graph.set_nodes(|nodes| nodes.iter().filter(|n| n.id != "n").cloned().collect::<Vec<_>>());
        manager.sync_nodes(&mut graph);
        assert!(!manager.is_pending("big.png"));
        assert!(!manager.release_asset_request("big.png"));
    }

    #[test]
    fn test_removed_reference_clears_status() {
        let mut manager = AssetTransferManager::new(MemoryAssetStore::new(), DataChannelTransport::new(), &small_chunks());
        let mut graph = GraphStore::new();
        graph.set_nodes(|_| vec![image("n", "a.png")]);
        manager.sync_nodes(&mut graph);
        assert!(status(&graph, "n").is_some());

        graph.set_nodes(|nodes| {
            let mut node = Node::clone(&nodes[0]);
            node.data.remove(ASSET_PATH_KEY);
            vec![Arc::new(node)]
        });
        manager.sync_nodes(&mut graph);
        assert_eq!(status(&graph, "n"), None);
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let message = AssetMessage::Complete { transfer_id: Uuid::new_v4() };
        let mut envelope = message.to_envelope().unwrap();
        assert_eq!(envelope.kind, MessageKind::AssetComplete);
        envelope.kind = MessageKind::AssetChunk;
        assert_eq!(
            AssetMessage::from_envelope(&envelope),
            Err(ProtocolError::UnexpectedKind(MessageKind::AssetChunk))
        );
    }
}
