use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Node, NodeLiveState, NodeStatus};

/// A node's static configuration merged with its live state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    #[serde(flatten)]
    pub live: NodeLiveState,
}

impl NodeView {
    pub fn id(&self) -> &str {
        &self.node.id
    }
}

/// Registry and live states captured together, in registry order.
/// Placement decisions and stats are computed from one of these and never
/// from the shared maps directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeView>,
    pub taken_at: DateTime<Utc>,
}

impl ClusterSnapshot {
    pub fn get(&self, node_id: &str) -> Option<&NodeView> {
        self.nodes.iter().find(|v| v.node.id == node_id)
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats::from_views(&self.nodes)
    }

    /// Replaces every stored status with its `effective_status` as of
    /// `taken_at`, so a node with a stale heartbeat reads as offline.
    pub fn with_effective_status(mut self, stale_after: Duration) -> Self {
        for v in &mut self.nodes {
            v.live.status = v.live.effective_status(self.taken_at, stale_after);
        }
        self
    }

    /// Node count per status, every status listed even when zero.
    pub fn count_by_status(&self) -> Vec<(NodeStatus, usize)> {
        let all = [
            NodeStatus::Online,
            NodeStatus::Busy,
            NodeStatus::Offline,
            NodeStatus::Error,
            NodeStatus::Maintenance,
        ];
        all.into_iter()
            .map(|status| {
                let n = self.nodes.iter().filter(|v| v.live.status == status).count();
                (status, n)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterStats {
    pub total_nodes: u32,
    pub online_nodes: u32,
    pub total_gpus: u32,
    /// GPUs with any free memory on online nodes.
    pub available_gpus: u32,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub active_kernels: u32,
    /// Capacity of online nodes only.
    pub max_kernels: u32,
}

impl ClusterStats {
    pub fn from_views(views: &[NodeView]) -> Self {
        let mut stats = ClusterStats {
            total_nodes: views.len() as u32,
            ..Default::default()
        };

        for v in views {
            stats.total_gpus += v.live.gpus.len() as u32;
            stats.total_memory_mb += v.live.memory_total_mb;
            stats.active_kernels += v.live.active_kernels;

            if v.live.status == NodeStatus::Online {
                stats.online_nodes += 1;
                stats.available_gpus +=
                    v.live.gpus.iter().filter(|g| g.memory_free_mb > 0).count() as u32;
                stats.available_memory_mb += v.live.memory_available_mb;
                stats.max_kernels += v.node.max_kernels;
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::GpuInfo;

    fn view(id: &str, status: NodeStatus, gpus_free: &[u64], active: u32) -> NodeView {
        NodeView {
            node: Node {
                id: id.to_string(),
                name: id.to_string(),
                host: "127.0.0.1".to_string(),
                port: 8888,
                tags: BTreeSet::new(),
                priority: 0,
                max_kernels: 4,
                maintenance: false,
                created_at: Utc::now(),
            },
            live: NodeLiveState {
                status,
                gpus: gpus_free
                    .iter()
                    .enumerate()
                    .map(|(i, free)| GpuInfo {
                        index: i as u32,
                        memory_total_mb: 24_000,
                        memory_free_mb: *free,
                        memory_used_mb: 24_000 - free,
                        ..Default::default()
                    })
                    .collect(),
                memory_total_mb: 64_000,
                memory_available_mb: 32_000,
                active_kernels: active,
                ..NodeLiveState::offline()
            },
        }
    }

    #[test]
    fn stats_only_count_online_capacity() {
        let views = vec![
            view("a", NodeStatus::Online, &[20_000, 0], 1),
            view("b", NodeStatus::Offline, &[24_000], 2),
            view("c", NodeStatus::Busy, &[1_000], 4),
        ];
        let stats = ClusterStats::from_views(&views);

        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.online_nodes, 1);
        assert_eq!(stats.total_gpus, 4);
        assert_eq!(stats.available_gpus, 1);
        assert_eq!(stats.total_memory_mb, 192_000);
        assert_eq!(stats.available_memory_mb, 32_000);
        assert_eq!(stats.active_kernels, 7);
        assert_eq!(stats.max_kernels, 4);
    }

    #[test]
    fn stale_heartbeats_read_as_offline() {
        let taken_at = Utc::now();
        let mut fresh = view("fresh", NodeStatus::Online, &[10], 0);
        fresh.live.last_heartbeat = Some(taken_at - chrono::Duration::seconds(5));
        let mut stale = view("stale", NodeStatus::Busy, &[10], 4);
        stale.live.last_heartbeat = Some(taken_at - chrono::Duration::seconds(120));
        let mut parked = view("parked", NodeStatus::Maintenance, &[10], 0);
        parked.live.last_heartbeat = Some(taken_at - chrono::Duration::seconds(120));

        let snapshot = ClusterSnapshot {
            nodes: vec![fresh, stale, parked],
            taken_at,
        }
        .with_effective_status(Duration::from_secs(60));

        let statuses: Vec<_> = snapshot.nodes.iter().map(|v| v.live.status).collect();
        assert_eq!(
            statuses,
            vec![NodeStatus::Online, NodeStatus::Offline, NodeStatus::Maintenance]
        );
        let stats = snapshot.stats();
        assert_eq!(stats.online_nodes, 1);
        assert_eq!(stats.max_kernels, 4);
        assert_eq!(stats.active_kernels, 4);

        let counts = snapshot.count_by_status();
        assert!(counts.contains(&(NodeStatus::Offline, 1)));
        assert!(counts.contains(&(NodeStatus::Busy, 0)));
        assert_eq!(counts.len(), 5);
    }

    #[test]
    fn node_view_flattens_static_and_live_fields() {
        let v = view("a", NodeStatus::Online, &[10], 0);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["id"], "a");
        assert_eq!(json["status"], "online");
        assert_eq!(json["max_kernels"], 4);
        assert_eq!(json["gpus"][0]["memory_free_mb"], 10);
    }
}
