use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type NodeId = String;

/// Port the kernel gateway listens on when a registration omits it.
pub const DEFAULT_GATEWAY_PORT: u16 = 8888;
pub const DEFAULT_MAX_KERNELS: u32 = 10;

/// Static configuration of a registered worker node. Everything here is
/// admin-controlled and persisted; live health lives in `NodeLiveState`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub host: String,
    pub port: u16,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Higher is preferred by the placement engine.
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_max_kernels")]
    pub max_kernels: u32,

    /// Drained by an operator: still probed, never selected.
    #[serde(default)]
    pub maintenance: bool,

    pub created_at: DateTime<Utc>,
}

fn default_max_kernels() -> u32 {
    DEFAULT_MAX_KERNELS
}

fn default_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

impl Node {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn has_all_tags(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.tags)
    }
}

/// Registration body for a new node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    #[serde(default)]
    pub name: String,
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub priority: i32,

    /// Falls back to the manager's configured default.
    #[serde(default)]
    pub max_kernels: Option<u32>,
}

/// Partial update of a node's static configuration. The id and host are
/// fixed for the lifetime of the node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_kernels: Option<u32>,
    #[serde(default)]
    pub maintenance: Option<bool>,
}

impl NodeUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.port.is_none()
            && self.tags.is_none()
            && self.priority.is_none()
            && self.max_kernels.is_none()
            && self.maintenance.is_none()
    }

    /// Applies the patch in place. Validation is the caller's job.
    pub fn apply_to(&self, node: &mut Node) {
        if let Some(name) = &self.name {
            node.name = name.clone();
        }
        if let Some(port) = self.port {
            node.port = port;
        }
        if let Some(tags) = &self.tags {
            node.tags = tags.iter().cloned().collect();
        }
        if let Some(priority) = self.priority {
            node.priority = priority;
        }
        if let Some(max_kernels) = self.max_kernels {
            node.max_kernels = max_kernels;
        }
        if let Some(maintenance) = self.maintenance {
            node.maintenance = maintenance;
        }
    }
}
