//! Peer-discovery contract. The discovery service itself (address books,
//! gossip of peer lists) is out of scope; the manager treats its answers
//! as best-effort hints.

use async_trait::async_trait;

/// What the discovery service reports about one peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: String,
    pub http_address: String,
    pub raft_address: String,
    pub raft_log_index: u64,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn get_all_peers(&self) -> Vec<PeerInfo>;

    async fn get_active_peers(&self) -> Vec<PeerInfo>;

    async fn trigger_peer_exchange(&self);

    async fn trigger_sync(&self);

    async fn force_write_peers_json(&self);
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// A static, in-process discovery fake for tests.
    #[derive(Default)]
    pub struct StaticDiscovery {
        peers: Mutex<Vec<PeerInfo>>,
    }

    impl StaticDiscovery {
        pub fn new(peers: Vec<PeerInfo>) -> Self {
            Self {
                peers: Mutex::new(peers),
            }
        }
    }

    #[async_trait]
    impl Discovery for StaticDiscovery {
        async fn get_all_peers(&self) -> Vec<PeerInfo> {
            self.peers.lock().clone()
        }

        async fn get_active_peers(&self) -> Vec<PeerInfo> {
            self.peers.lock().clone()
        }

        async fn trigger_peer_exchange(&self) {}

        async fn trigger_sync(&self) {}

        async fn force_write_peers_json(&self) {}
    }
}
