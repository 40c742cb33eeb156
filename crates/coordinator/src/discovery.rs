//! Peer discovery
//!
//! Only the static method is implemented: peers come from the
//! `coordinator.peers` section of the configuration.

use crate::executor::PeerDiscovery;
use crate::node::{NodeCapabilities, NodeDescriptor};
use async_trait::async_trait;
use nodemesh_common::config::PeerConfig;
use nodemesh_common::Result;

/// Discovery over a fixed peer list
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<NodeDescriptor>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<NodeDescriptor>) -> Self {
        Self { peers }
    }

    pub fn from_config(peers: &[PeerConfig]) -> Self {
        let peers = peers
            .iter()
            .map(|peer| NodeDescriptor {
                id: peer.id.clone(),
                hostname: peer.hostname.clone().unwrap_or_else(|| peer.id.clone()),
                address: peer.address.clone(),
                available_models: peer.models.iter().cloned().collect(),
                capabilities: NodeCapabilities {
                    gpu_available: peer.gpu_available,
                    gpu_count: u32::from(peer.gpu_available),
                    ..Default::default()
                },
            })
            .collect();

        Self { peers }
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<NodeDescriptor>> {
        Ok(self.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery_from_config() {
        let discovery = StaticDiscovery::from_config(&[PeerConfig {
            id: "peer-a".to_string(),
            address: "http://10.0.0.2:50051".to_string(),
            hostname: None,
            models: vec!["llama-7b".to_string()],
            gpu_available: true,
        }]);

        let peers = discovery.discover().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].hostname, "peer-a");
        assert!(peers[0].available_models.contains("llama-7b"));
        assert!(peers[0].capabilities.gpu_available);
    }
}
