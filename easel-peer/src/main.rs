//! Easel Peer — two in-process canvases collaborating without a server.
//!
//! Runs the manual offer/answer exchange over the loopback connector, then
//! edits the shared graph, moves cursors and pulls an image asset across.
//! Set `RUST_LOG=debug` to watch every channel message.

mod state;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use easel_collab::{Asset, CollabConfig, ConnectionState, LoopbackConnector, MemoryAssetStore, PeerConnector};
use easel_core::model::ASSET_PATH_KEY;
use easel_core::{Edge, Node, NodeType, Position};
use log::{info, warn};
use state::PeerState;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Tick both peers until neither has anything left to do.
fn run_until_idle(a: &mut PeerState, b: &mut PeerState) {
    for _ in 0..64 {
        if a.tick() + b.tick() == 0 {
            return;
        }
    }
    warn!("Peers still busy after 64 rounds");
}

async fn connect(alice: &mut PeerState, bob: &mut PeerState) -> Result<(), Box<dyn Error>> {
    let offer = alice.session.create_offer().await?;
    info!("{} -> {}: offer ({} bytes)", alice.name, bob.name, offer.len());
    bob.session.set_remote_offer(&offer)?;

    let answer = bob.session.create_answer().await?;
    info!("{} -> {}: answer ({} bytes)", bob.name, alice.name, answer.len());
    alice.session.set_remote_answer(&answer)?;

    for candidate in alice.session.local_candidates()? {
        bob.session.add_candidate(&candidate)?;
    }
    for candidate in bob.session.local_candidates()? {
        alice.session.add_candidate(&candidate)?;
    }

    for peer in [alice, bob] {
        if !peer.session.wait_for_state(ConnectionState::Connected, CONNECT_TIMEOUT).await {
            return Err(format!("{} did not connect", peer.name).into());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Easel Peer demo...");

    let config = CollabConfig::local();
    let connector: Arc<dyn PeerConnector> = Arc::new(LoopbackConnector::new());

    let mut library = MemoryAssetStore::new();
    library.insert(
        "moodboard/hero.png",
        Asset::from_path("moodboard/hero.png", vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]),
    );
    let mut alice = PeerState::new("alice", Arc::clone(&connector), &config, library);
    let mut bob = PeerState::new("bob", connector, &config, MemoryAssetStore::new());

    connect(&mut alice, &mut bob).await?;
    info!("Connected");

    alice.history.perform_action(&mut alice.graph, Some("Add cards"), |graph| {
        graph.set_graph(
            |_| {
                vec![
                    Arc::new(Node::with_id("idea", NodeType::Sticky, Position::new(0.0, 0.0)).with_data("text", "Idea")),
                    Arc::new(
                        Node::with_id("hero", NodeType::Image, Position::new(240.0, 0.0))
                            .with_size(320.0, 180.0)
                            .with_data(ASSET_PATH_KEY, "moodboard/hero.png"),
                    ),
                ]
            },
            |_| vec![Arc::new(Edge::new("idea-hero", "idea", "hero"))],
        );
    });
    alice.presence.pointer_moved(Position::new(12.0, 8.0));
    alice.presence.select_node(Some("idea"));
    run_until_idle(&mut alice, &mut bob);

    info!("{} sees {} nodes, {} edges", bob.name, bob.graph.nodes().len(), bob.graph.edges().len());
    for collaborator in bob.presence.remote_collaborators() {
        info!(
            "{} sees {} ({}) {:?} on {:?}",
            bob.name, collaborator.label, collaborator.color, collaborator.interaction, collaborator.node_id
        );
    }
    if let Some(hero) = bob.graph.node("hero") {
        info!("{} asset status: {:?}", bob.name, hero.data.get("asset-status"));
    }

    bob.history.perform_action(&mut bob.graph, Some("Move idea"), |graph| {
        graph.set_nodes(|nodes| {
            nodes
                .iter()
                .map(|n| {
                    if n.id == "idea" {
                        let mut moved = Node::clone(n);
                        moved.position = Position::new(-120.0, 60.0);
                        Arc::new(moved)
                    } else {
                        Arc::clone(n)
                    }
                })
                .collect::<Vec<_>>()
        });
    });
    run_until_idle(&mut alice, &mut bob);
    if let Some(idea) = alice.graph.node("idea") {
        info!("{} sees idea at {:?}", alice.name, idea.position);
    }

    bob.history.undo(&mut bob.graph);
    run_until_idle(&mut alice, &mut bob);
    if let Some(idea) = alice.graph.node("idea") {
        info!("After undo {} sees idea at {:?}", alice.name, idea.position);
    }

    alice.presence.leave();
    alice.session.close();
    run_until_idle(&mut alice, &mut bob);
    info!("{} connection: {:?}", bob.name, bob.session.connection_state());
    Ok(())
}
