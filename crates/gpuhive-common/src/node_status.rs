use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
    Error,
    Maintenance,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Busy => "busy",
            NodeStatus::Error => "error",
            NodeStatus::Maintenance => "maintenance",
        }
    }

    /// The gateway answered its last probe.
    pub fn is_reachable(&self) -> bool {
        matches!(self, NodeStatus::Online | NodeStatus::Busy)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub utilization_pct: u32,
    pub temperature_c: u32,
    pub power_w: f64,
    #[serde(default)]
    pub driver_version: String,
    #[serde(default)]
    pub cuda_version: String,
}

/// Health and capacity of one node as last observed by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeLiveState {
    pub status: NodeStatus,

    #[serde(default)]
    pub gpus: Vec<GpuInfo>,

    pub cpu_count: u32,
    pub cpu_percent: f64,
    pub memory_total_mb: u64,
    pub memory_available_mb: u64,
    pub active_kernels: u32,

    /// Last successful probe; `None` until the node has answered once.
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Start time of the probe that produced this state. Used to order
    /// concurrent updates for the same node.
    pub probed_at: Option<DateTime<Utc>>,
}

impl Default for NodeLiveState {
    fn default() -> Self {
        Self::offline()
    }
}

impl NodeLiveState {
    pub fn offline() -> Self {
        Self {
            status: NodeStatus::Offline,
            gpus: Vec::new(),
            cpu_count: 0,
            cpu_percent: 0.0,
            memory_total_mb: 0,
            memory_available_mb: 0,
            active_kernels: 0,
            last_heartbeat: None,
            probed_at: None,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match self.last_heartbeat {
            None => true,
            // a heartbeat ahead of `now` (clock skew) counts as fresh
            Some(hb) => (now - hb).to_std().map(|age| age > stale_after).unwrap_or(false),
        }
    }

    /// Status re-evaluated against heartbeat age: a reachable node whose
    /// heartbeat has gone stale is reported offline.
    pub fn effective_status(&self, now: DateTime<Utc>, stale_after: Duration) -> NodeStatus {
        match self.status {
            NodeStatus::Online | NodeStatus::Busy if self.is_stale(now, stale_after) => {
                NodeStatus::Offline
            }
            status => status,
        }
    }

    pub fn gpu(&self, index: u32) -> Option<&GpuInfo> {
        self.gpus.iter().find(|g| g.index == index)
    }

    pub fn max_free_gpu_memory_mb(&self) -> u64 {
        self.gpus.iter().map(|g| g.memory_free_mb).max().unwrap_or(0)
    }
}
