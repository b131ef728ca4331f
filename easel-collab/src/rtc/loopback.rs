//! In-process peer connections.
//!
//! Connections created by the same [`LoopbackConnector`] (or its clones)
//! can reach each other. A session description carries the id of the
//! connection that produced it; two connections link once each holds a
//! local description and a remote description naming the other. Linking
//! opens every channel either side created and announces it to the other
//! side, the way a remote peer's channels show up in a real connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::{
    ChannelState, ConnectionState, DataChannel, IceCandidate, PeerConnection, PeerConnector, RtcError, RtcEvent,
    SdpType, SessionDescription,
};

#[derive(Clone, Default)]
pub struct LoopbackConnector {
    registry: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    peers: HashMap<u64, PeerEntry>,
    /// Remote candidates accepted by any connection, in application order.
    applied_candidates: Vec<IceCandidate>,
}

struct PeerEntry {
    events: mpsc::UnboundedSender<RtcEvent>,
    local: Option<SessionDescription>,
    remote_peer: Option<u64>,
    linked: Option<u64>,
    /// Channels created on this side, in creation order.
    created: Vec<String>,
    channels: HashMap<String, ChannelState>,
    closed: bool,
}

impl PeerEntry {
    fn emit(&self, event: RtcEvent) {
        // The session may already have dropped its receiver.
        let _ = self.events.send(event);
    }
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote candidates accepted so far, in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.registry).applied_candidates.clone()
    }

    /// Connections currently linked to a peer.
    pub fn linked_count(&self) -> usize {
        lock(&self.registry).peers.values().filter(|p| p.linked.is_some()).count()
    }
}

impl PeerConnector for LoopbackConnector {
    fn connect(
        &self,
        ice_servers: &[String],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<RtcEvent>), RtcError> {
        let (events, rx) = mpsc::unbounded_channel();
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.peers.insert(
            id,
            PeerEntry {
                events,
                local: None,
                remote_peer: None,
                linked: None,
                created: Vec::new(),
                channels: HashMap::new(),
                closed: false,
            },
        );
        log::debug!("Loopback connection {id} created ({} ICE servers ignored)", ice_servers.len());

        let connection = LoopbackConnection {
            id,
            registry: Arc::clone(&self.registry),
        };
        Ok((Arc::new(connection), rx))
    }
}

struct LoopbackConnection {
    id: u64,
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackConnection {
    fn describe(&self, sdp_type: SdpType) -> Result<SessionDescription, RtcError> {
        let registry = lock(&self.registry);
        let entry = live_entry(&registry, self.id)?;
        let sdp = format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=easel-loopback\r\nt=0 0\r\na=channels:{}\r\n",
            self.id,
            entry.created.join(",")
        );
        Ok(SessionDescription { sdp_type, sdp })
    }
}

impl PeerConnection for LoopbackConnection {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, RtcError> {
        let mut registry = lock(&self.registry);
        let entry = live_entry_mut(&mut registry, self.id)?;
        if entry.linked.is_some() {
            return Err(RtcError::InvalidState("channels must be created before negotiation".into()));
        }
        if !entry.created.iter().any(|l| l == label) {
            entry.created.push(label.to_string());
            entry.channels.insert(label.to_string(), ChannelState::Connecting);
        }
        Ok(Arc::new(LoopbackChannel {
            owner: self.id,
            label: label.to_string(),
            registry: Arc::clone(&self.registry),
        }))
    }

    fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.describe(SdpType::Offer)
    }

    fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        {
            let registry = lock(&self.registry);
            if live_entry(&registry, self.id)?.remote_peer.is_none() {
                return Err(RtcError::InvalidState("answer requires a remote offer".into()));
            }
        }
        self.describe(SdpType::Answer)
    }

    fn set_local_description(&self, description: &SessionDescription) -> Result<(), RtcError> {
        let mut registry = lock(&self.registry);
        let entry = live_entry_mut(&mut registry, self.id)?;
        entry.local = Some(description.clone());
        entry.emit(RtcEvent::IceCandidate(IceCandidate {
            candidate: format!(
                "candidate:{id} 1 udp 2130706431 127.0.0.1 {port} typ host",
                id = self.id,
                port = 50_000 + self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
        try_link(&mut registry, &self.registry, self.id);
        Ok(())
    }

    fn set_remote_description(&self, description: &SessionDescription) -> Result<(), RtcError> {
        let peer = parse_origin(&description.sdp)?;
        let mut registry = lock(&self.registry);
        if peer == self.id || !registry.peers.contains_key(&peer) {
            return Err(RtcError::Negotiation(format!("unknown remote connection {peer}")));
        }
        let entry = live_entry_mut(&mut registry, self.id)?;
        if let Some(local) = &entry.local {
            if local.sdp_type == description.sdp_type {
                return Err(RtcError::InvalidState(format!("remote {:?} after local {:?}", description.sdp_type, local.sdp_type)));
            }
        }
        entry.remote_peer = Some(peer);
        try_link(&mut registry, &self.registry, self.id);
        Ok(())
    }

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
        let mut registry = lock(&self.registry);
        if live_entry(&registry, self.id)?.remote_peer.is_none() {
            return Err(RtcError::InvalidState("candidate before remote description".into()));
        }
        registry.applied_candidates.push(candidate.clone());
        Ok(())
    }

    fn close(&self) {
        let mut registry = lock(&self.registry);
        let Some(entry) = registry.peers.get_mut(&self.id) else {
            return;
        };
        if entry.closed {
            return;
        }
        entry.closed = true;
        let peer = entry.linked.take();
        close_channels(entry);
        entry.emit(RtcEvent::ConnectionStateChanged(ConnectionState::Closed));

        if let Some(peer) = peer.and_then(|p| registry.peers.get_mut(&p)) {
            peer.linked = None;
            close_channels(peer);
            peer.emit(RtcEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        }
        log::debug!("Loopback connection {} closed", self.id);
    }
}

struct LoopbackChannel {
    owner: u64,
    label: String,
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("owner", &self.owner)
            .field("label", &self.label)
            .finish()
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        lock(&self.registry)
            .peers
            .get(&self.owner)
            .and_then(|e| e.channels.get(&self.label).copied())
            .unwrap_or(ChannelState::Closed)
    }

    fn send(&self, data: &[u8]) -> Result<(), RtcError> {
        let registry = lock(&self.registry);
        let entry = registry.peers.get(&self.owner).ok_or(RtcError::Closed)?;
        if entry.channels.get(&self.label) != Some(&ChannelState::Open) {
            return Err(RtcError::ChannelNotOpen(self.label.clone()));
        }
        let peer = entry
            .linked
            .and_then(|p| registry.peers.get(&p))
            .ok_or(RtcError::Closed)?;
        peer.events
            .send(RtcEvent::ChannelMessage {
                label: self.label.clone(),
                data: data.to_vec(),
            })
            .map_err(|_| RtcError::Closed)
    }

    fn close(&self) {
        let mut registry = lock(&self.registry);
        let peer = registry.peers.get(&self.owner).and_then(|e| e.linked);
        for id in std::iter::once(self.owner).chain(peer) {
            if let Some(entry) = registry.peers.get_mut(&id) {
                set_channel_state(entry, &self.label, ChannelState::Closed);
            }
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

fn live_entry(registry: &Registry, id: u64) -> Result<&PeerEntry, RtcError> {
    match registry.peers.get(&id) {
        Some(entry) if !entry.closed => Ok(entry),
        _ => Err(RtcError::Closed),
    }
}

fn live_entry_mut(registry: &mut Registry, id: u64) -> Result<&mut PeerEntry, RtcError> {
    match registry.peers.get_mut(&id) {
        Some(entry) if !entry.closed => Ok(entry),
        _ => Err(RtcError::Closed),
    }
}

/// Connection id from the `o=` line.
fn parse_origin(sdp: &str) -> Result<u64, RtcError> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=- "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| RtcError::Negotiation("session description has no loopback origin".into()))
}

fn set_channel_state(entry: &mut PeerEntry, label: &str, state: ChannelState) {
    if entry.channels.get(label) == Some(&state) {
        return;
    }
    entry.channels.insert(label.to_string(), state);
    entry.emit(RtcEvent::ChannelStateChanged {
        label: label.to_string(),
        state,
    });
}

fn close_channels(entry: &mut PeerEntry) {
    let labels: Vec<String> = entry.channels.keys().cloned().collect();
    for label in labels {
        set_channel_state(entry, &label, ChannelState::Closed);
    }
}

fn try_link(registry: &mut Registry, shared: &Arc<Mutex<Registry>>, id: u64) {
    let Some(entry) = registry.peers.get(&id) else {
        return;
    };
    if entry.closed || entry.linked.is_some() || entry.local.is_none() {
        return;
    }
    let Some(peer_id) = entry.remote_peer else {
        return;
    };
    let ready = registry.peers.get(&peer_id).is_some_and(|peer| {
        !peer.closed && peer.linked.is_none() && peer.local.is_some() && peer.remote_peer == Some(id)
    });
    if !ready {
        return;
    }

    for (a, b) in [(id, peer_id), (peer_id, id)] {
        if let Some(entry) = registry.peers.get_mut(&a) {
            entry.linked = Some(b);
            entry.emit(RtcEvent::ConnectionStateChanged(ConnectionState::Connecting));
            entry.emit(RtcEvent::ConnectionStateChanged(ConnectionState::Connected));
        }
    }

    for (owner, other) in [(id, peer_id), (peer_id, id)] {
        let labels = registry.peers.get(&owner).map(|e| e.created.clone()).unwrap_or_default();
        for label in labels {
            if let Some(entry) = registry.peers.get_mut(&owner) {
                set_channel_state(entry, &label, ChannelState::Open);
            }
            if let Some(entry) = registry.peers.get_mut(&other) {
                if entry.channels.contains_key(&label) {
                    continue;
                }
                entry.channels.insert(label.clone(), ChannelState::Connecting);
                entry.emit(RtcEvent::DataChannel(Arc::new(LoopbackChannel {
                    owner: other,
                    label: label.clone(),
                    registry: Arc::clone(shared),
                })));
                set_channel_state(entry, &label, ChannelState::Open);
            }
        }
    }
    log::debug!("Loopback connections {id} and {peer_id} linked");
}
