//! Connection-table exchange. Every opened link receives our table; every
//! table we receive may name peers we have not dialed yet.

use vibespace_core::{MeshPayload, PeerId};

use crate::registry::ConnectionRegistry;

/// `GOSSIP` listing ourselves followed by every registered peer.
pub fn announcement(local: &str, registry: &ConnectionRegistry) -> MeshPayload {
    let mut peers = Vec::with_capacity(registry.len() + 1);
    peers.push(local.to_owned());
    peers.extend(registry.peers());
    MeshPayload::Gossip { peers }
}

/// Identifiers from a received table that still need a dial, in list order.
pub fn discover(local: &str, registry: &ConnectionRegistry, peers: &[PeerId]) -> Vec<PeerId> {
    let mut fresh: Vec<PeerId> = Vec::new();
    for peer in peers {
        if peer.is_empty() || peer == local || registry.is_known(peer) || fresh.contains(peer) {
            continue;
        }
        fresh.push(peer.clone());
    }
    fresh
}
