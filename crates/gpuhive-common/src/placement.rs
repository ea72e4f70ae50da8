use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Hard constraints for placing one kernel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementRequest {
    /// Manual placement. Bypasses ranking; never falls back to auto.
    #[serde(default)]
    pub node_id: Option<NodeId>,

    #[serde(default = "default_require_gpu")]
    pub require_gpu: bool,

    /// 0 means no minimum.
    #[serde(default, rename = "min_gpu_memory", alias = "min_gpu_memory_mb")]
    pub min_gpu_memory_mb: u64,

    /// The node must carry every one of these.
    #[serde(default, rename = "tags", alias = "required_tags")]
    pub required_tags: BTreeSet<String>,

    #[serde(default)]
    pub gpu_index: Option<u32>,
}

fn default_require_gpu() -> bool {
    true
}

impl Default for PlacementRequest {
    fn default() -> Self {
        Self {
            node_id: None,
            require_gpu: default_require_gpu(),
            min_gpu_memory_mb: 0,
            required_tags: BTreeSet::new(),
            gpu_index: None,
        }
    }
}

impl PlacementRequest {
    /// Human readable summary of the constraints, e.g.
    /// `online node with ≥8000MB free GPU memory and tag 'training'`.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.require_gpu {
            match (self.gpu_index, self.min_gpu_memory_mb) {
                (Some(idx), 0) => parts.push(format!("GPU {idx}")),
                (Some(idx), mb) => parts.push(format!("≥{mb}MB free on GPU {idx}")),
                (None, 0) => parts.push("a GPU".to_string()),
                (None, mb) => parts.push(format!("≥{mb}MB free GPU memory")),
            }
        }
        if !self.required_tags.is_empty() {
            let quoted: Vec<String> = self
                .required_tags
                .iter()
                .map(|t| format!("'{t}'"))
                .collect();
            let noun = if quoted.len() == 1 { "tag" } else { "tags" };
            parts.push(format!("{noun} {}", quoted.join(", ")));
        }

        let mut out = String::from("online node with a free kernel slot");
        if !parts.is_empty() {
            let _ = write!(out, ", {}", parts.join(" and "));
        }
        out
    }
}
