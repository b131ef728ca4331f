//! One canvas participant: document, history and collaboration components
//! sharing a single peer connection.

use std::sync::Arc;

use easel_collab::{
    AssetTransferManager, CollabConfig, DocumentSync, MemoryAssetStore, PeerConnector, PeerSignalingSession,
    PresenceBroadcaster,
};
use easel_core::{GraphStore, UndoRedoManager};

pub struct PeerState {
    pub name: &'static str,
    pub session: PeerSignalingSession,
    pub graph: GraphStore,
    pub history: UndoRedoManager,
    pub presence: PresenceBroadcaster,
    pub assets: AssetTransferManager<MemoryAssetStore>,
    docs: DocumentSync,
}

impl PeerState {
    pub fn new(
        name: &'static str,
        connector: Arc<dyn PeerConnector>,
        config: &CollabConfig,
        assets: MemoryAssetStore,
    ) -> Self {
        let session = PeerSignalingSession::new(connector, config.clone());
        let transport = session.transport();
        Self {
            name,
            graph: GraphStore::new(),
            history: UndoRedoManager::default(),
            docs: DocumentSync::new(transport.clone(), config),
            presence: PresenceBroadcaster::new(transport.clone(), config),
            assets: AssetTransferManager::new(assets, transport, config),
            session,
        }
    }

    /// Drain connection events and run every component once.
    pub fn tick(&mut self) -> usize {
        let mut work = self.session.pump();
        work += self.docs.process(&mut self.graph);
        work += self.presence.process_incoming();
        self.presence.flush();
        work += self.assets.process(&mut self.graph);
        work
    }
}
