//! Presence: who is pointing at, selecting or typing in what.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer / selection / typing
//!       │
//!       ▼
//! PresenceBroadcaster  (pointer moves throttled to presence_interval)
//!       │
//!       ▼   PresenceUpdate on the sync channel
//! Remote PresenceBroadcaster::process_incoming()
//!       │
//!       ▼
//! CollaboratorRegistry  (stable color + label per client)
//! ```
//!
//! Leaving the canvas and changing selection or typing state bypass the
//! throttle so remote peers never show a stale cursor or caret.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use easel_core::Position;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::protocol::{Envelope, MessageKind};
use crate::transport::{ChannelEvent, DataChannelTransport, HandlerId, Inbox};

/// Collaborator colors, assigned in join order.
pub const PALETTE: [&str; 8] = [
    "#E5484D", "#3E63DD", "#30A46C", "#F76B15", "#8E4EC6", "#12A594", "#D6409F", "#FFC53D",
];

// ───────────────────────────────────────────────────────────────────
// Wire format
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interaction {
    Pointer,
    Selecting,
    Typing,
    /// The client left the session.
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub client_id: Uuid,
    /// Per-sender sequence number; older updates are dropped.
    pub seq: u64,
    /// `None` hides the cursor.
    pub position: Option<Position>,
    pub node_id: Option<String>,
    pub interaction: Interaction,
}

// ───────────────────────────────────────────────────────────────────
// Remote collaborators
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorIdentity {
    pub color: &'static str,
    pub label: String,
}

impl CollaboratorIdentity {
    /// Identity of the `index`-th collaborator to join.
    pub fn for_join_index(index: usize) -> Self {
        Self {
            color: PALETTE[index % PALETTE.len()],
            label: format!("Collaborator {}", index + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub client_id: Uuid,
    pub position: Option<Position>,
    pub node_id: Option<String>,
    pub interaction: Interaction,
    pub color: &'static str,
    pub label: String,
}

/// Collaborators on one node, by what they are doing there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePresence {
    pub selecting: Vec<Collaborator>,
    pub typing: Vec<Collaborator>,
}

/// Session-scoped memo of remote identities plus the visible list.
#[derive(Debug, Default)]
pub struct CollaboratorRegistry {
    identities: HashMap<Uuid, CollaboratorIdentity>,
    last_seq: HashMap<Uuid, u64>,
    /// Visible collaborators in order of appearance.
    visible: Vec<Collaborator>,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable identity for `client_id`, assigned on first sight.
    pub fn identity(&mut self, client_id: Uuid) -> CollaboratorIdentity {
        let next = self.identities.len();
        self.identities
            .entry(client_id)
            .or_insert_with(|| CollaboratorIdentity::for_join_index(next))
            .clone()
    }

    /// Apply a remote update. Returns `false` for stale updates.
    pub fn observe(&mut self, update: &PresenceUpdate) -> bool {
        let id = update.client_id;
        if self.last_seq.get(&id).is_some_and(|&last| update.seq <= last) {
            return false;
        }
        self.last_seq.insert(id, update.seq);
        let identity = self.identity(id);

        if update.interaction == Interaction::Leave {
            self.visible.retain(|c| c.client_id != id);
            log::debug!("{} left", identity.label);
            return true;
        }

        let collaborator = Collaborator {
            client_id: id,
            position: update.position,
            node_id: update.node_id.clone(),
            interaction: update.interaction,
            color: identity.color,
            label: identity.label,
        };
        match self.visible.iter_mut().find(|c| c.client_id == id) {
            Some(slot) => *slot = collaborator,
            None => self.visible.push(collaborator),
        }
        true
    }

    pub fn remote_collaborators(&self) -> &[Collaborator] {
        &self.visible
    }

    pub fn node_presence(&self, node_id: &str) -> NodePresence {
        let mut presence = NodePresence::default();
        for c in self.visible.iter().filter(|c| c.node_id.as_deref() == Some(node_id)) {
            match c.interaction {
                Interaction::Selecting => presence.selecting.push(c.clone()),
                Interaction::Typing => presence.typing.push(c.clone()),
                Interaction::Pointer | Interaction::Leave => {}
            }
        }
        presence
    }

    /// Forget everything, including identities.
    pub fn clear(&mut self) {
        self.identities.clear();
        self.last_seq.clear();
        self.visible.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Broadcaster
// ───────────────────────────────────────────────────────────────────

pub struct PresenceBroadcaster {
    transport: DataChannelTransport,
    channel: String,
    client_id: Uuid,
    interval: Duration,
    last_sent: Option<Instant>,
    seq: u64,
    position: Option<Position>,
    node_id: Option<String>,
    interaction: Interaction,
    last_selected: Option<String>,
    /// A pointer move was throttled and not sent yet.
    dirty: bool,
    registry: CollaboratorRegistry,
    inbox: Inbox<Envelope>,
    handler: HandlerId,
}

impl PresenceBroadcaster {
    pub fn new(transport: DataChannelTransport, config: &CollabConfig) -> Self {
        Self::with_interval(transport, config, config.presence_interval)
    }

    /// Create with a custom throttle interval (for testing).
    pub fn with_interval(transport: DataChannelTransport, config: &CollabConfig, interval: Duration) -> Self {
        let inbox = Inbox::default();
        let sink = inbox.clone();
        let handler = transport.set_channel_handler(&config.sync_channel, move |event| {
            if let ChannelEvent::Message(envelope) = event {
                if envelope.kind == MessageKind::Presence {
                    sink.push(envelope.clone());
                }
            }
        });

        Self {
            transport,
            channel: config.sync_channel.clone(),
            client_id: Uuid::new_v4(),
            interval,
            last_sent: None,
            seq: 0,
            position: None,
            node_id: None,
            interaction: Interaction::Pointer,
            last_selected: None,
            dirty: false,
            registry: CollaboratorRegistry::new(),
            inbox,
            handler,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn interaction(&self) -> Interaction {
        self.interaction
    }

    pub fn focused_node(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Throttled. Returns whether an update went out.
    pub fn pointer_moved(&mut self, position: Position) -> bool {
        self.position = Some(position);
        if self.last_sent.is_some_and(|t| t.elapsed() < self.interval) {
            self.dirty = true;
            return false;
        }
        self.broadcast()
    }

    /// Pointer left the canvas: clear the position right away.
    pub fn pointer_left(&mut self) -> bool {
        self.position = None;
        self.broadcast()
    }

    pub fn select_node(&mut self, node_id: Option<&str>) -> bool {
        self.last_selected = node_id.map(str::to_owned);
        self.node_id = self.last_selected.clone();
        self.interaction = if node_id.is_some() {
            Interaction::Selecting
        } else {
            Interaction::Pointer
        };
        self.broadcast()
    }

    pub fn start_typing(&mut self, node_id: &str) -> bool {
        self.node_id = Some(node_id.to_string());
        self.interaction = Interaction::Typing;
        self.broadcast()
    }

    /// Revert to selecting the last selected node, or to plain pointer.
    pub fn stop_typing(&mut self) -> bool {
        if self.interaction != Interaction::Typing {
            return false;
        }
        self.node_id = self.last_selected.clone();
        self.interaction = if self.node_id.is_some() {
            Interaction::Selecting
        } else {
            Interaction::Pointer
        };
        self.broadcast()
    }

    /// Announce departure. Remote peers hide this client but keep its identity.
    pub fn leave(&mut self) -> bool {
        self.position = None;
        self.node_id = None;
        self.interaction = Interaction::Leave;
        self.broadcast()
    }

    /// Send a throttled pointer move once the interval has passed.
    pub fn flush(&mut self) -> bool {
        if !self.dirty || self.last_sent.is_some_and(|t| t.elapsed() < self.interval) {
            return false;
        }
        self.broadcast()
    }

    /// Apply presence received since the last call. Returns how many
    /// updates changed the collaborator list.
    pub fn process_incoming(&mut self) -> usize {
        let mut applied = 0;
        for envelope in self.inbox.drain() {
            let update: PresenceUpdate = match envelope.payload_as() {
                Ok(update) => update,
                Err(e) => {
                    log::warn!("Ignoring malformed presence update: {e}");
                    continue;
                }
            };
            if update.client_id != self.client_id && self.registry.observe(&update) {
                applied += 1;
            }
        }
        applied
    }

    pub fn remote_collaborators(&self) -> &[Collaborator] {
        self.registry.remote_collaborators()
    }

    pub fn node_presence(&self, node_id: &str) -> NodePresence {
        self.registry.node_presence(node_id)
    }

    /// Drop every remote identity. The next session starts from the
    /// first palette color again.
    pub fn end_session(&mut self) {
        self.registry.clear();
        self.inbox.drain();
    }

    fn broadcast(&mut self) -> bool {
        self.seq += 1;
        let update = PresenceUpdate {
            client_id: self.client_id,
            seq: self.seq,
            position: self.position,
            node_id: self.node_id.clone(),
            interaction: self.interaction,
        };
        let sent = match Envelope::with_payload(MessageKind::Presence, &update) {
            Ok(envelope) => self.transport.send_envelope(&self.channel, &envelope),
            Err(e) => {
                log::warn!("Failed to encode presence: {e}");
                false
            }
        };
        if sent {
            self.last_sent = Some(Instant::now());
            self.dirty = false;
        }
        sent
    }
}

impl Drop for PresenceBroadcaster {
    fn drop(&mut self) {
        self.transport.clear_channel_handler(self.handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::linked_transports;

    fn update(client_id: Uuid, seq: u64, node: Option<&str>, interaction: Interaction) -> PresenceUpdate {
        PresenceUpdate {
            client_id,
            seq,
            position: Some(Position::new(1.0, 2.0)),
            node_id: node.map(str::to_owned),
            interaction,
        }
    }

    fn pair(interval: Duration) -> (PresenceBroadcaster, PresenceBroadcaster) {
        let config = CollabConfig::local();
        let (a, b) = linked_transports(&["sync"]);
        (
            PresenceBroadcaster::with_interval(a, &config, interval),
            PresenceBroadcaster::with_interval(b, &config, interval),
        )
    }

    #[test]
    fn test_identity_is_stable_and_cycles_palette() {
        let mut registry = CollaboratorRegistry::new();
        let ids: Vec<Uuid> = (0..9).map(|_| Uuid::new_v4()).collect();
        let identities: Vec<_> = ids.iter().map(|id| registry.identity(*id)).collect();

        assert_eq!(identities[0].label, "Collaborator 1");
        assert_eq!(identities[0].color, PALETTE[0]);
        assert_eq!(identities[7].color, PALETTE[7]);
        assert_eq!(identities[8].color, PALETTE[0]);
        assert_eq!(identities[8].label, "Collaborator 9");
        assert_eq!(registry.identity(ids[3]), identities[3]);
    }

    #[test]
    fn test_stale_updates_are_dropped() {
        let mut registry = CollaboratorRegistry::new();
        let id = Uuid::new_v4();
        assert!(registry.observe(&update(id, 2, Some("a"), Interaction::Selecting)));
        assert!(!registry.observe(&update(id, 1, Some("b"), Interaction::Selecting)));
        assert_eq!(registry.remote_collaborators()[0].node_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_leave_hides_but_keeps_identity() {
        let mut registry = CollaboratorRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        registry.observe(&update(first, 1, None, Interaction::Pointer));
        registry.observe(&update(second, 1, None, Interaction::Pointer));

        registry.observe(&update(first, 2, None, Interaction::Leave));
        assert_eq!(registry.remote_collaborators().len(), 1);

        registry.observe(&update(first, 3, None, Interaction::Pointer));
        let back = registry.remote_collaborators().iter().find(|c| c.client_id == first).unwrap();
        assert_eq!(back.label, "Collaborator 1");
        assert_eq!(back.color, PALETTE[0]);
    }

    #[test]
    fn test_node_presence_groups_by_interaction() {
        let mut registry = CollaboratorRegistry::new();
        registry.observe(&update(Uuid::new_v4(), 1, Some("n"), Interaction::Selecting));
        registry.observe(&update(Uuid::new_v4(), 1, Some("n"), Interaction::Typing));
        registry.observe(&update(Uuid::new_v4(), 1, Some("other"), Interaction::Typing));

        let presence = registry.node_presence("n");
        assert_eq!(presence.selecting.len(), 1);
        assert_eq!(presence.typing.len(), 1);
        assert_eq!(registry.node_presence("missing"), NodePresence::default());
    }

    #[test]
    fn test_pointer_moves_are_throttled() {
        let (mut alice, mut bob) = pair(Duration::from_secs(60));

        assert!(alice.pointer_moved(Position::new(1.0, 1.0)));
        assert!(!alice.pointer_moved(Position::new(2.0, 2.0)));
        assert!(!alice.flush());

        bob.process_incoming();
        assert_eq!(bob.remote_collaborators()[0].position, Some(Position::new(1.0, 1.0)));
    }

    #[test]
    fn test_flush_sends_throttled_position() {
        let (mut alice, mut bob) = pair(Duration::ZERO);
        alice.pointer_moved(Position::new(1.0, 1.0));
        assert!(!alice.flush());

        alice.last_sent = Some(Instant::now());
        alice.interval = Duration::from_secs(60);
        assert!(!alice.pointer_moved(Position::new(5.0, 5.0)));
        alice.interval = Duration::ZERO;
        assert!(alice.flush());

        bob.process_incoming();
        assert_eq!(bob.remote_collaborators()[0].position, Some(Position::new(5.0, 5.0)));
    }

    #[test]
    fn test_pointer_leave_bypasses_throttle() {
        let (mut alice, mut bob) = pair(Duration::from_secs(60));
        alice.pointer_moved(Position::new(1.0, 1.0));
        assert!(alice.pointer_left());

        bob.process_incoming();
        let remote = &bob.remote_collaborators()[0];
        assert_eq!(remote.position, None);
        assert_eq!(remote.interaction, Interaction::Pointer);
    }

    #[test]
    fn test_typing_reverts_to_selection() {
        let (mut alice, mut bob) = pair(Duration::from_secs(60));

        alice.select_node(Some("card"));
        alice.start_typing("card");
        bob.process_incoming();
        assert_eq!(bob.node_presence("card").typing.len(), 1);

        assert!(alice.stop_typing());
        assert_eq!(alice.interaction(), Interaction::Selecting);
        assert_eq!(alice.focused_node(), Some("card"));
        bob.process_incoming();
        let presence = bob.node_presence("card");
        assert_eq!(presence.selecting.len(), 1);
        assert!(presence.typing.is_empty());

        assert!(!alice.stop_typing());
    }

    #[test]
    fn test_typing_without_selection_reverts_to_pointer() {
        let (mut alice, _bob) = pair(Duration::ZERO);
        alice.start_typing("card");
        alice.stop_typing();
        assert_eq!(alice.interaction(), Interaction::Pointer);
        assert_eq!(alice.focused_node(), None);
    }

    #[test]
    fn test_leave_and_end_session() {
        let (mut alice, mut bob) = pair(Duration::ZERO);
        alice.pointer_moved(Position::new(3.0, 3.0));
        bob.process_incoming();
        assert_eq!(bob.remote_collaborators().len(), 1);

        assert!(alice.leave());
        bob.process_incoming();
        assert!(bob.remote_collaborators().is_empty());

        bob.end_session();
        assert_eq!(bob.registry.identity(Uuid::new_v4()).label, "Collaborator 1");
    }

    #[test]
    fn test_send_without_channel_fails_quietly() {
        let config = CollabConfig::local();
        let mut lonely = PresenceBroadcaster::new(DataChannelTransport::new(), &config);
        assert!(!lonely.pointer_moved(Position::ORIGIN));
        assert!(!lonely.select_node(Some("x")));
    }

    #[test]
    fn test_own_updates_are_ignored() {
        let config = CollabConfig::local();
        let (a, _b) = linked_transports(&["sync"]);
        let mut alice = PresenceBroadcaster::new(a.clone(), &config);
        let echo = PresenceBroadcaster::new(a, &config);
        drop(echo);

        let own = update(alice.client_id(), 1, None, Interaction::Pointer);
        let envelope = Envelope::with_payload(MessageKind::Presence, &own).unwrap();
        alice.inbox.push(envelope);
        assert_eq!(alice.process_incoming(), 0);
    }
}
