use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{NodeId, PlacementRequest};

pub const DEFAULT_KERNEL_NAME: &str = "python3";

fn default_kernel_name() -> String {
    DEFAULT_KERNEL_NAME.to_string()
}

/// Body of `POST /cluster/kernels`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateKernelRequest {
    #[serde(default)]
    pub placement: PlacementRequest,

    #[serde(default = "default_kernel_name")]
    pub kernel_name: String,

    /// Forwarded to the gateway's kernel start call.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for CreateKernelRequest {
    fn default() -> Self {
        Self {
            placement: PlacementRequest::default(),
            kernel_name: default_kernel_name(),
            env: BTreeMap::new(),
        }
    }
}

/// Result of a successful kernel start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelLaunch {
    pub kernel_id: String,
    pub node_id: NodeId,
    pub node_name: String,

    /// Raw gateway response for the started kernel.
    #[serde(default)]
    pub kernel: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelLocation {
    pub kernel_id: String,
    pub node_id: NodeId,
    pub websocket_url: String,
}
