//! Peer-connection primitives consumed by the signaling session.
//!
//! A native WebRTC binding implements [`PeerConnector`], [`PeerConnection`]
//! and [`DataChannel`]. Everything the connection reports asynchronously
//! (gathered candidates, state changes, remote channels, inbound messages)
//! arrives as [`RtcEvent`]s on the receiver returned by
//! [`PeerConnector::connect`].

mod loopback;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use loopback::LoopbackConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Serialized as `{"type":"offer","sdp":"…"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Serialized as `{"candidate":"…","sdpMid":"0","sdpMLineIndex":0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

/// Peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Guarded transitions of the signaling state machine.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Connecting) => true,
            (Connecting, Connected | Failed | Disconnected) => true,
            (Connected, Disconnected | Failed) => true,
            (Disconnected, Connected | Failed) => true,
            _ => false,
        }
    }
}

/// Ready state of one data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RtcError {
    #[error("Invalid connection state: {0}")]
    InvalidState(String),
    #[error("Channel {0} is not open")]
    ChannelNotOpen(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Connection closed")]
    Closed,
}

/// One named, ordered, reliable message stream.
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;
    fn ready_state(&self) -> ChannelState;
    fn send(&self, data: &[u8]) -> Result<(), RtcError>;
    fn close(&self);
}

pub trait PeerConnection: Send + Sync {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, RtcError>;
    fn create_offer(&self) -> Result<SessionDescription, RtcError>;
    fn create_answer(&self) -> Result<SessionDescription, RtcError>;
    fn set_local_description(&self, description: &SessionDescription) -> Result<(), RtcError>;
    fn set_remote_description(&self, description: &SessionDescription) -> Result<(), RtcError>;
    /// Fails while no remote description is set.
    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), RtcError>;
    fn close(&self);
}

/// Factory for peer connections.
pub trait PeerConnector: Send + Sync {
    fn connect(
        &self,
        ice_servers: &[String],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<RtcEvent>), RtcError>;
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone)]
pub enum RtcEvent {
    /// A local candidate was gathered.
    IceCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    /// A channel opened by the remote side arrived.
    DataChannel(Arc<dyn DataChannel>),
    ChannelStateChanged { label: String, state: ChannelState },
    ChannelMessage { label: String, data: Vec<u8> },
}
