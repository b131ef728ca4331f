//! # easel-collab — serverless peer-to-peer collaboration for Easel
//!
//! Connects two canvases directly. Signaling artifacts are relayed by hand;
//! once the peer connection is up, two data channels carry everything.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐  offer / answer / candidates (JSON text)
//! │ PeerSignalingSession│ ◄───────────────── out of band ─────────────►
//! └─────────┬──────────┘
//!           │ RtcEvents
//!           ▼
//! ┌────────────────────┐   "sync"           ┌──────────────────────┐
//! │ DataChannelTransport│ ─────────────────► │ DocumentSync          │
//! │  (per-label        │                    │ PresenceBroadcaster   │
//! │   handlers)        │   "file-transfer"  ├──────────────────────┤
//! │                    │ ─────────────────► │ AssetTransferManager  │
//! └────────────────────┘                    └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] — session settings
//! - [`protocol`] — binary envelope (bincode) shared by every channel
//! - [`rtc`] — peer-connection seam and an in-process loopback
//! - [`signaling`] — manual offer/answer/ICE exchange
//! - [`transport`] — labelled channels with attachable handlers
//! - [`doc_sync`] — replicates a `GraphStore` over the sync channel
//! - [`presence`] — cursors, selection and typing indicators
//! - [`assets`] — chunked, LZ4-compressed asset transfer

pub mod assets;
pub mod config;
pub mod doc_sync;
pub mod presence;
pub mod protocol;
pub mod rtc;
pub mod signaling;
pub mod transport;

pub use assets::{
    Asset, AssetError, AssetMessage, AssetStore, AssetTransferManager, DirectoryAssetStore, MemoryAssetStore,
    TransferDirection, TransferRecord, TransferStatus,
};
pub use config::CollabConfig;
pub use doc_sync::DocumentSync;
pub use presence::{
    Collaborator, CollaboratorIdentity, CollaboratorRegistry, Interaction, NodePresence, PresenceBroadcaster,
    PresenceUpdate, PALETTE,
};
pub use protocol::{Envelope, MessageKind, ProtocolError};
pub use rtc::{ChannelState, ConnectionState, LoopbackConnector, PeerConnector};
pub use signaling::{PeerSignalingSession, SignalingError};
pub use transport::{ChannelEvent, DataChannelTransport, HandlerId};
