//! Peer transport seam
//!
//! The orchestrator speaks to targets through this trait. The default
//! implementation is the coordinator's authoritative apply for passive
//! replicas: delivery is an in-process bookkeeping step, and the push
//! channel carries the resulting events to the node's listener.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::state::NodeRegistry;
use crate::store::chunks::ChunkHash;
use crate::sync::Delta;

/// Channel delivering deltas and chunk bodies to one target node
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Whether the target already holds the chunk body
    async fn has_chunk(&self, target: &str, hash: &ChunkHash) -> Result<bool>;

    /// Deliver one chunk body to the target
    async fn send_chunk(&self, target: &str, hash: &ChunkHash, bytes: &[u8]) -> Result<()>;

    /// Deliver the delta frame and wait for the target to acknowledge
    /// the version
    async fn commit_version(
        &self,
        target: &str,
        file_id: &str,
        version_id: &str,
        delta: &Delta,
    ) -> Result<()>;

    /// Drop any per-target state after the node leaves the fleet
    async fn forget_target(&self, _target: &str) {}
}

/// Authoritative apply for passive replicas.
///
/// Tracks which chunk bodies each target holds so a re-replication delta
/// only carries what is actually missing. Refuses delivery to targets
/// the registry considers offline.
pub struct CoordinatorTransport {
    registry: Arc<NodeRegistry>,
    held: RwLock<HashMap<String, HashSet<ChunkHash>>>,
}

impl CoordinatorTransport {
    /// Create a transport over the node registry
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            held: RwLock::new(HashMap::new()),
        }
    }

    async fn ensure_online(&self, target: &str) -> Result<()> {
        if self.registry.is_online(target).await {
            Ok(())
        } else {
            Err(Error::TargetOffline(target.to_string()))
        }
    }
}

#[async_trait]
impl PeerTransport for CoordinatorTransport {
    async fn has_chunk(&self, target: &str, hash: &ChunkHash) -> Result<bool> {
        let held = self.held.read().await;
        Ok(held
            .get(target)
            .map(|chunks| chunks.contains(hash))
            .unwrap_or(false))
    }

    async fn send_chunk(&self, target: &str, hash: &ChunkHash, _bytes: &[u8]) -> Result<()> {
        self.ensure_online(target).await?;
        let mut held = self.held.write().await;
        held.entry(target.to_string()).or_default().insert(*hash);
        Ok(())
    }

    async fn commit_version(
        &self,
        target: &str,
        _file_id: &str,
        _version_id: &str,
        _delta: &Delta,
    ) -> Result<()> {
        self.ensure_online(target).await
    }

    async fn forget_target(&self, target: &str) {
        let mut held = self.held.write().await;
        held.remove(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NodeInfo, NodeStatus};
    use crate::store::chunks::content_hash;
    use std::time::Duration;

    async fn registry_with(node: &str) -> Arc<NodeRegistry> {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(5)));
        registry
            .register(NodeInfo::new(
                node.to_string(),
                node.to_string(),
                "127.0.0.1".into(),
                9000,
            ))
            .await;
        registry
    }

    #[tokio::test]
    async fn test_send_records_held_chunk() {
        let registry = registry_with("n2").await;
        let transport = CoordinatorTransport::new(registry);

        let hash = content_hash(b"chunk");
        assert!(!transport.has_chunk("n2", &hash).await.unwrap());

        transport.send_chunk("n2", &hash, b"chunk").await.unwrap();
        assert!(transport.has_chunk("n2", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_target_refused() {
        let registry = registry_with("n2").await;
        registry
            .set_status("n2", NodeStatus::Offline)
            .await
            .unwrap();
        let transport = CoordinatorTransport::new(registry);

        let hash = content_hash(b"chunk");
        let err = transport
            .send_chunk("n2", &hash, b"chunk")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetOffline(_)));
    }

    #[tokio::test]
    async fn test_forget_target_drops_held_state() {
        let registry = registry_with("n2").await;
        let transport = CoordinatorTransport::new(registry);

        let hash = content_hash(b"chunk");
        transport.send_chunk("n2", &hash, b"chunk").await.unwrap();
        transport.forget_target("n2").await;
        assert!(!transport.has_chunk("n2", &hash).await.unwrap());
    }
}
