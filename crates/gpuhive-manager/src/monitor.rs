use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use gpuhive_common::{ClusterSnapshot, Node, NodeId, NodeLiveState, NodeStatus, NodeView};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ClusterError;
use crate::metrics::Metrics;
use crate::probe::NodeProbe;
use crate::registry::NodeRegistry;
use crate::ManagerConfig;

/// Keeps the live state of every registered node fresh.
///
/// Live states are only ever replaced whole. A result is applied only if it
/// comes from a probe that started after the one behind the current state,
/// and only while the node is still registered. Refreshes of the same node
/// are serialized; different nodes are probed in parallel up to the
/// configured concurrency.
pub struct HealthMonitor {
    registry: Arc<NodeRegistry>,
    probe: NodeProbe,
    live: DashMap<NodeId, NodeLiveState>,
    refresh_locks: DashMap<NodeId, Arc<Mutex<()>>>,
    interval: Duration,
    concurrency: usize,
    metrics: Arc<Metrics>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        probe: NodeProbe,
        config: &ManagerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            probe,
            live: DashMap::new(),
            refresh_locks: DashMap::new(),
            interval: config.poll_interval,
            concurrency: config.probe_concurrency.max(1),
            metrics,
        }
    }

    /// Starts tracking a node as offline until its first probe lands.
    pub fn seed(&self, node_id: &str) {
        self.live
            .entry(node_id.to_string())
            .or_insert_with(NodeLiveState::offline);
    }

    /// Drops all state for a node. Probes still in flight for it are discarded
    /// when they complete.
    pub fn discard(&self, node_id: &str) {
        self.live.remove(node_id);
        self.refresh_locks.remove(node_id);
    }

    pub fn state(&self, node_id: &str) -> Option<NodeLiveState> {
        self.live.get(node_id).map(|s| s.clone())
    }

    /// Registry and live states captured together. Membership cannot change
    /// while the snapshot is built.
    pub async fn snapshot(&self) -> ClusterSnapshot {
        let nodes = self
            .registry
            .with_nodes(|nodes| {
                nodes
                    .iter()
                    .map(|node| NodeView {
                        node: node.clone(),
                        live: self.state(&node.id).unwrap_or_default(),
                    })
                    .collect()
            })
            .await;
        ClusterSnapshot {
            nodes,
            taken_at: Utc::now(),
        }
    }

    /// Probes one node now and applies the result.
    pub async fn refresh_one(&self, node_id: &str) -> Result<NodeLiveState, ClusterError> {
        let lock = self
            .refresh_locks
            .entry(node_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let node = match self.registry.get(node_id).await {
            Ok(node) => node,
            Err(e) => {
                self.refresh_locks.remove(node_id);
                return Err(e);
            }
        };

        Metrics::inc(&self.metrics.probes_total);
        let state = match self.probe.probe(&node).await {
            Ok(state) => state,
            Err(e) => {
                Metrics::inc(&self.metrics.probe_failures_total);
                tracing::debug!(node_id=%node.id, node=%node.name, error=%e, "probe failed");
                e.to_state()
            }
        };

        self.apply(&node, state);
        self.state(node_id)
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))
    }

    /// Probes every registered node once. Returns how many were probed.
    pub async fn refresh_all(&self) -> usize {
        let ids: Vec<NodeId> = self
            .registry
            .with_nodes(|nodes| nodes.iter().map(|n| n.id.clone()).collect())
            .await;
        let count = ids.len();

        futures_util::stream::iter(ids)
            .for_each_concurrent(self.concurrency, |id| async move {
                if let Err(e) = self.refresh_one(&id).await {
                    tracing::debug!(node_id=%id, error=%e, "skipped refresh");
                }
            })
            .await;
        count
    }

    /// Applies a probe result. Returns false when the result was discarded,
    /// either because the node is gone or a newer probe already landed.
    pub fn apply(&self, node: &Node, mut state: NodeLiveState) -> bool {
        let Some(mut current) = self.live.get_mut(&node.id) else {
            tracing::debug!(node_id=%node.id, "discarding probe result for removed node");
            return false;
        };

        match (current.probed_at, state.probed_at) {
            (_, None) => return false,
            (Some(prev), Some(next)) if next <= prev => {
                tracing::debug!(node_id=%node.id, "discarding out-of-order probe result");
                return false;
            }
            _ => {}
        }

        state.last_heartbeat = state.last_heartbeat.max(current.last_heartbeat);
        if !state.status.is_reachable() {
            // keep the last known telemetry of an unreachable node
            state.gpus = std::mem::take(&mut current.gpus);
            state.cpu_count = current.cpu_count;
            state.cpu_percent = current.cpu_percent;
            state.memory_total_mb = current.memory_total_mb;
            state.memory_available_mb = current.memory_available_mb;
            state.active_kernels = current.active_kernels;
        }
        if node.maintenance {
            state.status = NodeStatus::Maintenance;
        }

        let previous = current.status;
        let next = state.status;
        *current = state;
        drop(current);

        if previous != next {
            log_transition(node, previous, next);
        }
        true
    }

    /// Runs health cycles until `shutdown` is cancelled. The first cycle
    /// starts immediately.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "health monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = std::time::Instant::now();
            let probed = tokio::select! {
                _ = shutdown.cancelled() => break,
                n = self.refresh_all() => n,
            };
            let online = self
                .live
                .iter()
                .filter(|s| s.status == NodeStatus::Online)
                .count();
            tracing::debug!(
                probed,
                online,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "health cycle finished"
            );
        }
        tracing::info!("health monitor stopped");
    }
}

fn log_transition(node: &Node, from: NodeStatus, to: NodeStatus) {
    match to {
        NodeStatus::Offline | NodeStatus::Error => {
            tracing::warn!(node_id=%node.id, node=%node.name, %from, %to, "node status changed")
        }
        _ => tracing::info!(node_id=%node.id, node=%node.name, %from, %to, "node status changed"),
    }
}
