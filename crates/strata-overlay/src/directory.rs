//! Peer directory: maps node ids to RPC addresses.

use crate::types::{NodeId, PeerAddr, PeerTarget};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Resolves node ids to addresses. A node is recognized iff it resolves.
pub trait PeerDirectory: Send + Sync {
    fn resolve(&self, node_id: &NodeId) -> Option<PeerAddr>;

    /// Record (or update) the address of `node_id`.
    fn register(&self, node_id: &NodeId, addr: &PeerAddr);

    fn is_known(&self, node_id: &NodeId) -> bool {
        self.resolve(node_id).is_some()
    }
}

/// In-memory directory seeded from configuration and learned from requests.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    peers: RwLock<HashMap<NodeId, PeerAddr>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory pre-populated with `peers`.
    pub fn with_peers(peers: impl IntoIterator<Item = PeerTarget>) -> Self {
        let directory = Self::new();
        for peer in peers {
            directory.register(&peer.node_id, &peer.addr);
        }
        directory
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerDirectory for StaticDirectory {
    fn resolve(&self, node_id: &NodeId) -> Option<PeerAddr> {
        self.peers.read().ok()?.get(node_id).cloned()
    }

    fn register(&self, node_id: &NodeId, addr: &PeerAddr) {
        if let Ok(mut peers) = self.peers.write() {
            if peers.insert(node_id.clone(), addr.clone()).as_ref() != Some(addr) {
                debug!(node_id = %node_id, addr = %addr, "Registered peer address");
            }
        }
    }
}
