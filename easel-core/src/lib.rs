//! # easel-core — collaborative state engine for the Easel canvas
//!
//! Holds the canvas graph (typed nodes + connectors) inside a Yrs document
//! and exposes a read-optimized snapshot to the UI layer.
//!
//! ## Architecture
//!
//! ```text
//!  UI mutation
//!      │  set_nodes / set_edges (one transaction, local origin)
//!      ▼
//! ┌──────────────┐  sanitize_for_sync  ┌─────────────────────────┐
//! │  GraphStore  │ ──────────────────► │ Yrs Doc                 │
//! │  (snapshot)  │                     │  "node-order" (array)   │
//! └──────▲───────┘                     │  "nodes"      (map)     │
//!        │  remote events only         │  "edge-order" (array)   │
//!        │  restore_transient_state    │  "edges"      (map)     │
//!        └──────────────────────────── └─────────────────────────┘
//!
//!  UndoRedoManager ── snapshot/diff history on top of GraphStore
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Node / Edge data model
//! - [`transient`] — strip and restore per-client UI state
//! - [`collab`] — [`GraphStore`], the CRDT-backed source of truth
//! - [`history`] — [`UndoRedoManager`]

pub mod collab;
pub mod history;
pub mod model;
pub mod transient;

use thiserror::Error;

pub use collab::{Entity, GraphStore};
pub use history::{ActionToken, CanvasSnapshot, HistoryConfig, HistoryEntry, UndoRedoManager, VOLATILE_KEYS};
pub use model::{Edge, EdgeData, Node, NodeType, Position};
pub use transient::{restore_transient_state, sanitize_for_sync, TRANSIENT_KEYS};

/// Errors raised by the canvas document layer.
#[derive(Error, Debug)]
pub enum CanvasError {
    #[error("CRDT decode error: {0}")]
    Decode(String),
    #[error("CRDT apply error: {0}")]
    Apply(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<yrs::encoding::read::Error> for CanvasError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CanvasError::Decode(e.to_string())
    }
}
