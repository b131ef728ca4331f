//! Manual offer/answer signaling.
//!
//! Offer, answer and candidate artifacts are JSON text blobs meant to be
//! relayed out of band (clipboard, chat). There is no signaling server.
//!
//! ```text
//!  initiator                              responder
//!  create_offer() ──── offer text ─────►  set_remote_offer()
//!                                         create_answer()
//!  set_remote_answer() ◄── answer text ──
//!  add_candidate() ◄──── candidates ────► add_candidate()
//! ```
//!
//! Starting a new exchange tears down the previous connection and clears
//! every locally observable buffer first.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::CollabConfig;
use crate::rtc::{
    ChannelState, ConnectionState, IceCandidate, PeerConnection, PeerConnector, RtcError, RtcEvent, SdpType,
    SessionDescription,
};
use crate::transport::DataChannelTransport;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Malformed signaling text: {0}")]
    Parse(String),
    #[error("Failed to serialize signaling artifact: {0}")]
    Encode(String),
    #[error("No peer connection; create or accept an offer first")]
    NoConnection,
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Rtc(#[from] RtcError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// One peer connection and the manual exchange that establishes it.
pub struct PeerSignalingSession {
    connector: Arc<dyn PeerConnector>,
    config: CollabConfig,
    connection: Option<Arc<dyn PeerConnection>>,
    events: Option<mpsc::UnboundedReceiver<RtcEvent>>,
    role: Option<Role>,
    state: ConnectionState,
    has_remote_description: bool,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    local_candidates: Vec<IceCandidate>,
    local_description: Option<String>,
    transport: DataChannelTransport,
}

impl PeerSignalingSession {
    pub fn new(connector: Arc<dyn PeerConnector>, config: CollabConfig) -> Self {
        Self {
            connector,
            config,
            connection: None,
            events: None,
            role: None,
            state: ConnectionState::New,
            has_remote_description: false,
            pending_candidates: Vec::new(),
            local_candidates: Vec::new(),
            local_description: None,
            transport: DataChannelTransport::new(),
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// Channels of the current connection. Survives reconnection.
    pub fn transport(&self) -> DataChannelTransport {
        self.transport.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn data_channel_state(&self, label: &str) -> Option<ChannelState> {
        self.transport.channel_state(label)
    }

    /// Serialized offer or answer produced by this side, if any.
    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    /// Gathered local candidates as JSON blobs for the other side.
    pub fn local_candidates(&self) -> Result<Vec<String>, SignalingError> {
        self.local_candidates.iter().map(to_json).collect()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    // ---------------------------------------------------------------
    // Initiator
    // ---------------------------------------------------------------

    /// Start a new connection and return the offer text.
    ///
    /// Both channels are created before negotiation so the responder
    /// discovers them. Waits `candidate_settle` for local candidates.
    pub async fn create_offer(&mut self) -> Result<String, SignalingError> {
        let connection = self.open_connection(Role::Initiator)?;
        let offer = match self.start_offer(&connection) {
            Ok(offer) => offer,
            Err(e) => {
                self.teardown();
                return Err(e);
            }
        };

        self.settle(self.config.candidate_settle).await;
        let text = to_json(&offer)?;
        self.local_description = Some(text.clone());
        Ok(text)
    }

    fn start_offer(&self, connection: &Arc<dyn PeerConnection>) -> Result<SessionDescription, SignalingError> {
        for label in self.config.channel_labels() {
            let channel = connection.create_data_channel(label)?;
            self.transport.attach_channel(channel);
        }
        let offer = connection.create_offer()?;
        connection.set_local_description(&offer)?;
        Ok(offer)
    }

    /// Apply the responder's answer and flush buffered candidates.
    ///
    /// A rejected answer tears the connection down. A rejected candidate
    /// does not stop the flush; the first such error is returned once every
    /// buffered candidate has been offered.
    pub fn set_remote_answer(&mut self, text: &str) -> Result<(), SignalingError> {
        let answer = parse_description(text, SdpType::Answer)?;
        let connection = self.connection.clone().ok_or(SignalingError::NoConnection)?;
        if self.role != Some(Role::Initiator) {
            return Err(SignalingError::InvalidState("answer received without a local offer".into()));
        }
        if self.has_remote_description {
            return Err(SignalingError::InvalidState("remote answer already applied".into()));
        }
        if let Err(e) = self.apply_remote_description(&connection, &answer) {
            self.teardown();
            return Err(e);
        }
        self.flush_candidates(&connection)
    }

    // ---------------------------------------------------------------
    // Responder
    // ---------------------------------------------------------------

    /// Start a new connection from the initiator's offer text.
    ///
    /// The text is parsed before anything is torn down, so a malformed
    /// offer leaves the current session untouched.
    pub fn set_remote_offer(&mut self, text: &str) -> Result<(), SignalingError> {
        let offer = parse_description(text, SdpType::Offer)?;
        let connection = self.open_connection(Role::Responder)?;
        if let Err(e) = self.apply_remote_description(&connection, &offer) {
            self.teardown();
            return Err(e);
        }
        self.flush_candidates(&connection)
    }

    /// Produce the answer text after [`set_remote_offer`](Self::set_remote_offer).
    pub async fn create_answer(&mut self) -> Result<String, SignalingError> {
        let connection = self.connection.clone().ok_or(SignalingError::NoConnection)?;
        if self.role != Some(Role::Responder) || !self.has_remote_description {
            return Err(SignalingError::InvalidState("no remote offer applied".into()));
        }
        if self.local_description.is_some() {
            return Err(SignalingError::InvalidState("answer already created".into()));
        }

        let answer = connection.create_answer()?;
        connection.set_local_description(&answer)?;

        self.settle(self.config.candidate_settle).await;
        let text = to_json(&answer)?;
        self.local_description = Some(text.clone());
        Ok(text)
    }

    // ---------------------------------------------------------------
    // Both sides
    // ---------------------------------------------------------------

    /// Add a remote candidate. Buffered until the remote description is set.
    pub fn add_candidate(&mut self, text: &str) -> Result<(), SignalingError> {
        let candidate: IceCandidate =
            serde_json::from_str(text).map_err(|e| SignalingError::Parse(e.to_string()))?;
        let Some(connection) = &self.connection else {
            return Err(SignalingError::NoConnection);
        };

        if !self.has_remote_description {
            self.pending_candidates.push(candidate);
            log::debug!("Buffered remote candidate ({} pending)", self.pending_candidates.len());
            return Ok(());
        }
        connection.add_ice_candidate(&candidate)?;
        Ok(())
    }

    /// Tear down the connection and move to `Closed`.
    pub fn close(&mut self) {
        let was_open = self.connection.is_some();
        self.teardown();
        self.state = ConnectionState::Closed;
        if was_open {
            log::info!("Peer connection closed");
        }
    }

    /// Handle every queued connection event without waiting.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.handle_event(&event);
            handled += 1;
        }
        handled
    }

    /// Wait for and handle the next connection event.
    pub async fn next_event(&mut self) -> Option<RtcEvent> {
        let event = self.events.as_mut()?.recv().await?;
        self.handle_event(&event);
        Some(event)
    }

    /// Handle events until the connection reaches `target` or `timeout`
    /// elapses. Returns whether `target` was reached.
    pub async fn wait_for_state(&mut self, target: ConnectionState, timeout: Duration) -> bool {
        if self.state == target {
            return true;
        }
        let wait = async {
            while self.next_event().await.is_some() {
                if self.state == target {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    fn handle_event(&mut self, event: &RtcEvent) {
        match event {
            RtcEvent::IceCandidate(candidate) => {
                log::debug!("Gathered local candidate {}", candidate.candidate);
                self.local_candidates.push(candidate.clone());
            }
            RtcEvent::ConnectionStateChanged(next) => self.transition(*next),
            RtcEvent::DataChannel(channel) => {
                log::debug!("Remote opened channel {}", channel.label());
                self.transport.attach_channel(Arc::clone(channel));
            }
            RtcEvent::ChannelStateChanged { label, state } => self.transport.update_state(label, *state),
            RtcEvent::ChannelMessage { label, data } => self.transport.deliver(label, data),
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if self.state.can_transition_to(next) {
            log::info!("Peer connection {:?} -> {:?}", self.state, next);
            self.state = next;
        } else {
            log::warn!("Ignoring illegal transition {:?} -> {:?}", self.state, next);
        }
    }

    fn open_connection(&mut self, role: Role) -> Result<Arc<dyn PeerConnection>, SignalingError> {
        self.teardown();
        let (connection, events) = self.connector.connect(&self.config.ice_servers)?;
        self.connection = Some(Arc::clone(&connection));
        self.events = Some(events);
        self.role = Some(role);
        log::info!("Created peer connection as {role:?}");
        Ok(connection)
    }

    fn apply_remote_description(
        &mut self,
        connection: &Arc<dyn PeerConnection>,
        description: &SessionDescription,
    ) -> Result<(), SignalingError> {
        connection.set_remote_description(description)?;
        self.has_remote_description = true;
        Ok(())
    }

    /// Offer every buffered candidate in arrival order, exactly once.
    fn flush_candidates(&mut self, connection: &Arc<dyn PeerConnection>) -> Result<(), SignalingError> {
        let buffered = std::mem::take(&mut self.pending_candidates);
        if !buffered.is_empty() {
            log::debug!("Flushing {} buffered candidates", buffered.len());
        }
        let mut first_error = None;
        for candidate in &buffered {
            if let Err(e) = connection.add_ice_candidate(candidate) {
                log::warn!("Remote candidate {} rejected: {e}", candidate.candidate);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Drop the connection and every buffer tied to it.
    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            log::debug!("Tearing down previous peer connection");
            connection.close();
        }
        self.events = None;
        self.role = None;
        self.state = ConnectionState::New;
        self.has_remote_description = false;
        self.pending_candidates.clear();
        self.local_candidates.clear();
        self.local_description = None;
        self.transport.reset();
    }

    async fn settle(&mut self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.pump();
    }
}

fn parse_description(text: &str, expected: SdpType) -> Result<SessionDescription, SignalingError> {
    let description: SessionDescription =
        serde_json::from_str(text).map_err(|e| SignalingError::Parse(e.to_string()))?;
    if description.sdp_type != expected {
        log::warn!("Expected {expected:?} but got {:?}", description.sdp_type);
        return Err(SignalingError::Parse(format!(
            "expected {expected:?}, got {:?}",
            description.sdp_type
        )));
    }
    Ok(description)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, SignalingError> {
    serde_json::to_string(value).map_err(|e| SignalingError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::rtc::{DataChannel, LoopbackConnector};
    use crate::transport::testing::RecordingChannel;

    const WAIT: Duration = Duration::from_secs(1);

    fn session(connector: &Arc<LoopbackConnector>) -> PeerSignalingSession {
        PeerSignalingSession::new(connector.clone(), CollabConfig::local())
    }

    fn candidate(n: u32) -> String {
        format!(r#"{{"candidate":"candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host","sdpMid":"0","sdpMLineIndex":0}}"#)
    }

    async fn handshake(alice: &mut PeerSignalingSession, bob: &mut PeerSignalingSession) {
        let offer = alice.create_offer().await.unwrap();
        bob.set_remote_offer(&offer).unwrap();
        let answer = bob.create_answer().await.unwrap();
        for c in bob.local_candidates().unwrap() {
            alice.add_candidate(&c).unwrap();
        }
        alice.set_remote_answer(&answer).unwrap();
        for c in alice.local_candidates().unwrap() {
            bob.add_candidate(&c).unwrap();
        }
        assert!(alice.wait_for_state(ConnectionState::Connected, WAIT).await);
        assert!(bob.wait_for_state(ConnectionState::Connected, WAIT).await);
        alice.pump();
        bob.pump();
    }

    #[tokio::test]
    async fn test_manual_exchange_connects_both_sides() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut alice = session(&connector);
        let mut bob = session(&connector);

        handshake(&mut alice, &mut bob).await;

        for side in [&alice, &bob] {
            assert_eq!(side.connection_state(), ConnectionState::Connected);
            assert_eq!(side.data_channel_state("sync"), Some(ChannelState::Open));
            assert_eq!(side.data_channel_state("file-transfer"), Some(ChannelState::Open));
        }
        assert_eq!(connector.linked_count(), 2);
    }

    #[tokio::test]
    async fn test_offer_is_json_description() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut alice = session(&connector);

        let offer = alice.create_offer().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&offer).unwrap();
        assert_eq!(value["type"], "offer");
        assert!(value["sdp"].as_str().unwrap().starts_with("v=0"));
        assert_eq!(alice.local_description(), Some(offer.as_str()));
        assert_eq!(alice.local_candidates().unwrap().len(), 1);
        assert_eq!(alice.data_channel_state("sync"), Some(ChannelState::Connecting));
    }

    #[tokio::test]
    async fn test_candidate_without_connection_is_rejected() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut bob = session(&connector);
        assert!(matches!(bob.add_candidate(&candidate(1)), Err(SignalingError::NoConnection)));
    }

    #[tokio::test]
    async fn test_early_candidates_flush_in_order_once() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut alice = session(&connector);
        let mut bob = session(&connector);

        let offer = alice.create_offer().await.unwrap();
        for n in 1..=3 {
            alice.add_candidate(&candidate(n)).unwrap();
        }
        assert_eq!(alice.pending_candidate_count(), 3);
        assert!(connector.applied_candidates().is_empty());

        bob.set_remote_offer(&offer).unwrap();
        let answer = bob.create_answer().await.unwrap();
        alice.set_remote_answer(&answer).unwrap();

        let applied: Vec<String> = connector.applied_candidates().into_iter().map(|c| c.candidate).collect();
        assert_eq!(
            applied,
            vec![
                "candidate:1 1 udp 1 10.0.0.1 9 typ host",
                "candidate:2 1 udp 1 10.0.0.2 9 typ host",
                "candidate:3 1 udp 1 10.0.0.3 9 typ host",
            ]
        );
        assert_eq!(alice.pending_candidate_count(), 0);

        // Later candidates go straight through.
        alice.add_candidate(&candidate(4)).unwrap();
        assert_eq!(connector.applied_candidates().len(), 4);
    }

    /// Connection that accepts every description and refuses candidate 2.
    struct PickyConnection {
        applied: Arc<Mutex<Vec<String>>>,
        reject_answer: bool,
        closed: Arc<Mutex<bool>>,
        _events: mpsc::UnboundedSender<RtcEvent>,
    }

    impl PeerConnection for PickyConnection {
        fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, RtcError> {
            Ok(RecordingChannel::new(label, ChannelState::Connecting))
        }
        fn create_offer(&self) -> Result<SessionDescription, RtcError> {
            Ok(SessionDescription {
                sdp_type: SdpType::Offer,
                sdp: "v=0".into(),
            })
        }
        fn create_answer(&self) -> Result<SessionDescription, RtcError> {
            Err(RtcError::InvalidState("initiator only".into()))
        }
        fn set_local_description(&self, _description: &SessionDescription) -> Result<(), RtcError> {
            Ok(())
        }
        fn set_remote_description(&self, _description: &SessionDescription) -> Result<(), RtcError> {
            if self.reject_answer {
                return Err(RtcError::Negotiation("answer does not match offer".into()));
            }
            Ok(())
        }
        fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError> {
            if candidate.candidate.starts_with("candidate:2 ") {
                return Err(RtcError::Negotiation("unreachable address".into()));
            }
            self.applied.lock().unwrap().push(candidate.candidate.clone());
            Ok(())
        }
        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[derive(Default)]
    struct PickyConnector {
        applied: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<bool>>,
        reject_answer: bool,
    }

    impl PeerConnector for PickyConnector {
        fn connect(
            &self,
            _ice_servers: &[String],
        ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<RtcEvent>), RtcError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let connection = PickyConnection {
                applied: Arc::clone(&self.applied),
                reject_answer: self.reject_answer,
                closed: Arc::clone(&self.closed),
                _events: tx,
            };
            Ok((Arc::new(connection), rx))
        }
    }

    const ANSWER: &str = r#"{"type":"answer","sdp":"v=0"}"#;

    #[tokio::test]
    async fn test_rejected_candidate_does_not_stop_flush() {
        let connector = Arc::new(PickyConnector::default());
        let mut alice = PeerSignalingSession::new(connector.clone(), CollabConfig::local());

        alice.create_offer().await.unwrap();
        for n in 1..=3 {
            alice.add_candidate(&candidate(n)).unwrap();
        }

        let result = alice.set_remote_answer(ANSWER);
        assert!(matches!(result, Err(SignalingError::Rtc(RtcError::Negotiation(_)))));
        assert_eq!(
            *connector.applied.lock().unwrap(),
            vec![
                "candidate:1 1 udp 1 10.0.0.1 9 typ host",
                "candidate:3 1 udp 1 10.0.0.3 9 typ host",
            ]
        );
        assert_eq!(alice.pending_candidate_count(), 0);
        assert!(!*connector.closed.lock().unwrap());

        // The answer itself was applied; later candidates go straight through.
        alice.add_candidate(&candidate(4)).unwrap();
        assert_eq!(connector.applied.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rejected_answer_tears_down() {
        let connector = Arc::new(PickyConnector {
            reject_answer: true,
            ..PickyConnector::default()
        });
        let mut alice = PeerSignalingSession::new(connector.clone(), CollabConfig::local());

        alice.create_offer().await.unwrap();
        alice.add_candidate(&candidate(1)).unwrap();

        assert!(matches!(alice.set_remote_answer(ANSWER), Err(SignalingError::Rtc(_))));
        assert!(*connector.closed.lock().unwrap());
        assert!(connector.applied.lock().unwrap().is_empty());
        assert_eq!(alice.pending_candidate_count(), 0);
        assert_eq!(alice.data_channel_state("sync"), None);
        assert!(matches!(alice.add_candidate(&candidate(2)), Err(SignalingError::NoConnection)));
    }

    #[tokio::test]
    async fn test_malformed_offer_leaves_no_state() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut bob = session(&connector);

        assert!(matches!(bob.set_remote_offer("not json"), Err(SignalingError::Parse(_))));
        assert!(matches!(
            bob.set_remote_offer(r#"{"type":"answer","sdp":"v=0"}"#),
            Err(SignalingError::Parse(_))
        ));
        assert_eq!(bob.connection_state(), ConnectionState::New);
        assert!(matches!(bob.add_candidate(&candidate(1)), Err(SignalingError::NoConnection)));
    }

    #[tokio::test]
    async fn test_unknown_offer_tears_down() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut bob = session(&connector);

        let bogus = r#"{"type":"offer","sdp":"v=0\r\no=- 999 1 IN IP4 127.0.0.1\r\n"}"#;
        assert!(matches!(bob.set_remote_offer(bogus), Err(SignalingError::Rtc(_))));
        assert!(matches!(bob.create_answer().await, Err(SignalingError::NoConnection)));
    }

    #[tokio::test]
    async fn test_role_checks() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut alice = session(&connector);
        let mut bob = session(&connector);

        assert!(matches!(bob.create_answer().await, Err(SignalingError::NoConnection)));

        let offer = alice.create_offer().await.unwrap();
        assert!(matches!(alice.create_answer().await, Err(SignalingError::InvalidState(_))));

        bob.set_remote_offer(&offer).unwrap();
        let answer = bob.create_answer().await.unwrap();
        assert!(matches!(bob.set_remote_answer(&answer), Err(SignalingError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_new_offer_replaces_previous_attempt() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut alice = session(&connector);
        let mut bob = session(&connector);
        handshake(&mut alice, &mut bob).await;

        let second = alice.create_offer().await.unwrap();
        assert_eq!(alice.connection_state(), ConnectionState::New);
        assert_eq!(alice.local_description(), Some(second.as_str()));
        assert_eq!(alice.local_candidates().unwrap().len(), 1);
        assert_eq!(alice.data_channel_state("sync"), Some(ChannelState::Connecting));

        // The old peer sees the drop.
        assert!(bob.wait_for_state(ConnectionState::Disconnected, WAIT).await);
        bob.pump();
        assert_eq!(bob.data_channel_state("sync"), Some(ChannelState::Closed));
    }

    #[tokio::test]
    async fn test_close() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut alice = session(&connector);
        let mut bob = session(&connector);
        handshake(&mut alice, &mut bob).await;

        alice.close();
        assert_eq!(alice.connection_state(), ConnectionState::Closed);
        assert_eq!(alice.data_channel_state("sync"), None);
        assert!(!alice.transport().send_message("sync", crate::protocol::MessageKind::Presence, Vec::new()));

        assert!(bob.wait_for_state(ConnectionState::Disconnected, WAIT).await);
    }
}
