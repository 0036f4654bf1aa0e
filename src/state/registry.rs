//! Node Registry
//!
//! Tracks registered nodes, their health, and status transitions. A node
//! that misses heartbeats for the configured window is marked offline;
//! the monitor reports newly offline nodes so in-flight replication
//! sessions targeting them can be failed promptly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Node status in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is reachable and current
    Online,
    /// Node is receiving replicated versions
    Syncing,
    /// Node missed heartbeats and is considered unreachable
    Offline,
    /// Node reported an unrecoverable error
    Error,
}

impl NodeStatus {
    /// Stable text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Syncing => "syncing",
            NodeStatus::Offline => "offline",
            NodeStatus::Error => "error",
        }
    }

    /// Parse the persisted text form
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "online" => Ok(NodeStatus::Online),
            "syncing" => Ok(NodeStatus::Syncing),
            "offline" => Ok(NodeStatus::Offline),
            "error" => Ok(NodeStatus::Error),
            other => Err(Error::Metadata(format!("unknown node status: {}", other))),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// State of a single registered node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier
    pub node_id: String,
    /// Human-readable name
    pub name: String,
    /// Reachable address
    pub address: String,
    /// Port for the node's listener
    pub port: u16,
    /// Capabilities advertised at registration
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Current status
    pub status: NodeStatus,
    /// When the node registered
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat time (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
}

impl NodeInfo {
    /// Create a freshly registered online node
    pub fn new(node_id: String, name: String, address: String, port: u16) -> Self {
        Self {
            node_id,
            name,
            address,
            port,
            capabilities: Vec::new(),
            status: NodeStatus::Online,
            registered_at: Utc::now(),
            last_heartbeat: Some(Instant::now()),
        }
    }

    /// Check whether a heartbeat arrived within `window`
    pub fn is_healthy(&self, window: Duration) -> bool {
        match self.last_heartbeat {
            Some(last) => last.elapsed() < window,
            None => false,
        }
    }

    /// Record a heartbeat
    pub fn touch(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }
}

/// In-memory registry of all known nodes
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeInfo>>,
    offline_after: Duration,
}

impl NodeRegistry {
    /// Create a registry with the given offline window
    pub fn new(offline_after: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            offline_after,
        }
    }

    /// Register a node. Re-registration of a known id refreshes its
    /// address and brings it back online. Returns true for a new node.
    pub async fn register(&self, mut info: NodeInfo) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&info.node_id) {
            Some(existing) => {
                existing.name = info.name;
                existing.address = info.address;
                existing.port = info.port;
                existing.capabilities = info.capabilities;
                existing.status = NodeStatus::Online;
                existing.touch();
                false
            }
            None => {
                info.status = NodeStatus::Online;
                info.touch();
                nodes.insert(info.node_id.clone(), info);
                true
            }
        }
    }

    /// Restore a persisted node without marking it online
    pub async fn restore(&self, mut info: NodeInfo) {
        let mut nodes = self.nodes.write().await;
        info.status = NodeStatus::Offline;
        info.last_heartbeat = None;
        nodes.insert(info.node_id.clone(), info);
    }

    /// Remove a node
    pub async fn remove(&self, node_id: &str) -> Option<NodeInfo> {
        let mut nodes = self.nodes.write().await;
        nodes.remove(node_id)
    }

    /// Get a node's state
    pub async fn get(&self, node_id: &str) -> Option<NodeInfo> {
        let nodes = self.nodes.read().await;
        nodes.get(node_id).cloned()
    }

    /// All known nodes
    pub async fn all(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        let mut all: Vec<NodeInfo> = nodes.values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    /// Nodes currently reachable (online or syncing)
    pub async fn online(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        let mut online: Vec<NodeInfo> = nodes
            .values()
            .filter(|n| matches!(n.status, NodeStatus::Online | NodeStatus::Syncing))
            .cloned()
            .collect();
        online.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        online
    }

    /// Whether a node is currently reachable
    pub async fn is_online(&self, node_id: &str) -> bool {
        let nodes = self.nodes.read().await;
        nodes
            .get(node_id)
            .map(|n| matches!(n.status, NodeStatus::Online | NodeStatus::Syncing))
            .unwrap_or(false)
    }

    /// Record a heartbeat from a node, reviving it if it was offline
    pub async fn heartbeat(&self, node_id: &str) -> Result<NodeStatus> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        node.touch();
        if node.status == NodeStatus::Offline {
            node.status = NodeStatus::Online;
        }
        Ok(node.status)
    }

    /// Set a node's status explicitly
    pub async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        node.status = status;
        Ok(())
    }

    /// Mark nodes that missed the offline window and return the ids that
    /// transitioned to offline during this pass.
    pub async fn check_timeouts(&self) -> Vec<String> {
        let mut nodes = self.nodes.write().await;
        let mut timed_out = Vec::new();

        for (id, node) in nodes.iter_mut() {
            if node.status == NodeStatus::Offline || node.last_heartbeat.is_none() {
                continue;
            }
            if !node.is_healthy(self.offline_after) {
                tracing::warn!(
                    "node {} missed heartbeats for {:?}, marking offline",
                    id,
                    self.offline_after
                );
                node.status = NodeStatus::Offline;
                timed_out.push(id.clone());
            }
        }

        timed_out
    }

    /// Number of registered nodes
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// True when no node is registered
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeInfo {
        NodeInfo::new(
            id.to_string(),
            format!("node {}", id),
            "127.0.0.1".to_string(),
            9000,
        )
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = NodeRegistry::new(Duration::from_secs(1));

        assert!(registry.register(node("n1")).await);
        assert!(!registry.register(node("n1")).await);
        assert_eq!(registry.len().await, 1);

        let info = registry.get("n1").await.unwrap();
        assert_eq!(info.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_heartbeat_revives_offline_node() {
        let registry = NodeRegistry::new(Duration::from_secs(1));
        registry.register(node("n1")).await;
        registry.set_status("n1", NodeStatus::Offline).await.unwrap();

        assert!(!registry.is_online("n1").await);
        registry.heartbeat("n1").await.unwrap();
        assert!(registry.is_online("n1").await);
    }

    #[tokio::test]
    async fn test_timeout_marks_offline_once() {
        let registry = NodeRegistry::new(Duration::from_millis(50));
        registry.register(node("n1")).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let first = registry.check_timeouts().await;
        assert_eq!(first, vec!["n1".to_string()]);

        // Already offline: no repeated transition.
        let second = registry.check_timeouts().await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_online_excludes_offline_nodes() {
        let registry = NodeRegistry::new(Duration::from_secs(1));
        registry.register(node("n1")).await;
        registry.register(node("n2")).await;
        registry.set_status("n2", NodeStatus::Offline).await.unwrap();

        let online = registry.online().await;
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].node_id, "n1");
    }
}
