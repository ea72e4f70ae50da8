use std::sync::Arc;

use anyhow::Context;
use gpuhive_common::{Node, NodeId, NodeUpdate};
use gpuhive_meta::MetaStore;
use tokio::sync::RwLock;

use crate::error::ClusterError;

const NODE_PREFIX: &str = "/nodes/";

fn node_key(id: &str) -> String {
    format!("{NODE_PREFIX}{id}")
}

/// Authoritative set of registered nodes.
///
/// Nodes are kept in registration order. Every mutation is written to the
/// backing store before it becomes visible; if the write fails the registry
/// is left unchanged. Insertion and removal run a hook while the writer lock
/// is still held, so state keyed by node id (live health, locks) can be
/// created and dropped atomically with registry membership.
pub struct NodeRegistry {
    store: Arc<dyn MetaStore>,
    nodes: RwLock<Vec<Node>>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            store,
            nodes: RwLock::new(Vec::new()),
        }
    }

    /// Loads every persisted node. Entries that do not parse are skipped
    /// with a warning.
    pub async fn load(store: Arc<dyn MetaStore>) -> anyhow::Result<Self> {
        let entries = store
            .list_prefix(NODE_PREFIX)
            .await
            .context("failed to list registered nodes")?;

        let mut nodes = Vec::with_capacity(entries.len());
        for (key, value, _rev) in entries {
            match serde_json::from_slice::<Node>(&value) {
                Ok(node) => nodes.push(node),
                Err(e) => tracing::warn!(%key, error=%e, "skipping unreadable node entry"),
            }
        }
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        tracing::info!(count = nodes.len(), "loaded node registry");
        Ok(Self {
            store,
            nodes: RwLock::new(nodes),
        })
    }

    pub async fn insert_with(
        &self,
        node: Node,
        hook: impl FnOnce(&Node),
    ) -> Result<NodeId, ClusterError> {
        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|n| n.id == node.id) {
            return Err(ClusterError::DuplicateNode(node.id));
        }
        self.persist(&node).await?;
        hook(&node);
        let id = node.id.clone();
        nodes.push(node);
        Ok(id)
    }

    pub async fn remove_with(
        &self,
        id: &str,
        hook: impl FnOnce(&Node),
    ) -> Result<Node, ClusterError> {
        let mut nodes = self.nodes.write().await;
        let pos = nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| ClusterError::NodeNotFound(id.to_string()))?;
        self.store
            .delete(&node_key(id))
            .await
            .map_err(ClusterError::Storage)?;
        let node = nodes.remove(pos);
        hook(&node);
        Ok(node)
    }

    /// Applies a patch and returns the updated node.
    pub async fn update(&self, id: &str, patch: &NodeUpdate) -> Result<Node, ClusterError> {
        let mut nodes = self.nodes.write().await;
        let current = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| ClusterError::NodeNotFound(id.to_string()))?;

        let mut next = current.clone();
        patch.apply_to(&mut next);
        self.persist(&next).await?;
        *current = next.clone();
        Ok(next)
    }

    pub async fn get(&self, id: &str) -> Result<Node, ClusterError> {
        self.nodes
            .read()
            .await
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| ClusterError::NodeNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Node> {
        self.nodes.read().await.clone()
    }

    /// Runs `f` over the registered nodes under the reader lock. No node can
    /// be added or removed while `f` runs.
    pub async fn with_nodes<R>(&self, f: impl FnOnce(&[Node]) -> R) -> R {
        let nodes = self.nodes.read().await;
        f(&nodes)
    }

    async fn persist(&self, node: &Node) -> Result<(), ClusterError> {
        let bytes = serde_json::to_vec(node)
            .map_err(|e| ClusterError::Storage(anyhow::Error::new(e)))?;
        self.store
            .put(&node_key(&node.id), bytes)
            .await
            .map_err(ClusterError::Storage)?;
        Ok(())
    }
}
