use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use gpuhive_common::{ClusterSnapshot, NodeId, NodeStatus, NodeView, PlacementRequest};

/// Why a single node cannot host the requested kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotRegistered,
    /// Not online (stale heartbeats count as offline).
    Status(NodeStatus),
    AtCapacity { active: u32, max: u32 },
    MissingTags(Vec<String>),
    NoGpu,
    GpuIndexMissing(u32),
    InsufficientGpuMemory { free_mb: u64, required_mb: u64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotRegistered => write!(f, "not registered"),
            Rejection::Status(status) => write!(f, "{status}"),
            Rejection::AtCapacity { active, max } => {
                write!(f, "at capacity ({active}/{max} kernels)")
            }
            Rejection::MissingTags(tags) => write!(f, "missing tags {}", tags.join(", ")),
            Rejection::NoGpu => write!(f, "no GPU"),
            Rejection::GpuIndexMissing(idx) => write!(f, "no GPU with index {idx}"),
            Rejection::InsufficientGpuMemory {
                free_mb,
                required_mb,
            } => write!(
                f,
                "insufficient GPU memory ({free_mb}MB free, {required_mb}MB required)"
            ),
        }
    }
}

/// Placement failed. `message` names the constraints and why each node
/// dropped out; `rejections` carries the same per node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct NoEligibleNode {
    pub message: String,
    pub rejections: Vec<(NodeId, Rejection)>,
}

struct Candidate<'a> {
    view: &'a NodeView,
    /// Free memory of the GPU the kernel would land on, for ranking.
    free_gpu_mb: u64,
}

#[derive(Debug, Clone)]
pub struct PlacementEngine {
    stale_after: Duration,
}

impl PlacementEngine {
    /// `stale_after` is the heartbeat age beyond which an online node is
    /// treated as offline, normally twice the health poll interval.
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn select(
        &self,
        req: &PlacementRequest,
        snapshot: &ClusterSnapshot,
    ) -> Result<NodeId, NoEligibleNode> {
        if let Some(node_id) = req.node_id.as_deref() {
            return self.select_manual(req, snapshot, node_id);
        }

        let mut candidates = Vec::new();
        let mut rejections = Vec::new();
        for view in &snapshot.nodes {
            match self.check(req, view, snapshot) {
                Ok(c) => candidates.push(c),
                Err(r) => rejections.push((view, r)),
            }
        }

        let Some(best) = candidates.into_iter().min_by(rank) else {
            let details = if rejections.is_empty() {
                "no nodes registered".to_string()
            } else {
                rejections
                    .iter()
                    .map(|(v, r)| format!("{}: {r}", v.node.name))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            return Err(NoEligibleNode {
                message: format!("no {} ({details})", req.describe()),
                rejections: rejections
                    .into_iter()
                    .map(|(v, r)| (v.node.id.clone(), r))
                    .collect(),
            });
        };

        tracing::debug!(
            node_id=%best.view.node.id,
            priority=best.view.node.priority,
            active_kernels=best.view.live.active_kernels,
            free_gpu_mb=best.free_gpu_mb,
            "placement selected node"
        );
        Ok(best.view.node.id.clone())
    }

    fn select_manual(
        &self,
        req: &PlacementRequest,
        snapshot: &ClusterSnapshot,
        node_id: &str,
    ) -> Result<NodeId, NoEligibleNode> {
        let Some(view) = snapshot.get(node_id) else {
            return Err(NoEligibleNode {
                message: format!("node '{node_id}' is not registered"),
                rejections: vec![(node_id.to_string(), Rejection::NotRegistered)],
            });
        };

        match self.check(req, view, snapshot) {
            Ok(_) => Ok(view.node.id.clone()),
            Err(r) => Err(NoEligibleNode {
                message: format!(
                    "node '{}' ({}) cannot host the kernel: {r}",
                    view.node.name, view.node.id
                ),
                rejections: vec![(view.node.id.clone(), r)],
            }),
        }
    }

    /// Evaluates the hard constraints for one node, in the order an operator
    /// would look at them: health, capacity, tags, GPU.
    fn check<'a>(
        &self,
        req: &PlacementRequest,
        view: &'a NodeView,
        snapshot: &ClusterSnapshot,
    ) -> Result<Candidate<'a>, Rejection> {
        let node = &view.node;
        let live = &view.live;

        let status = if node.maintenance {
            NodeStatus::Maintenance
        } else {
            live.effective_status(snapshot.taken_at, self.stale_after)
        };
        if status != NodeStatus::Online {
            return Err(Rejection::Status(status));
        }

        if live.active_kernels >= node.max_kernels {
            return Err(Rejection::AtCapacity {
                active: live.active_kernels,
                max: node.max_kernels,
            });
        }

        if !node.has_all_tags(&req.required_tags) {
            let missing = req
                .required_tags
                .difference(&node.tags)
                .cloned()
                .collect();
            return Err(Rejection::MissingTags(missing));
        }

        if !req.require_gpu {
            return Ok(Candidate {
                view,
                free_gpu_mb: live.max_free_gpu_memory_mb(),
            });
        }

        if live.gpus.is_empty() {
            return Err(Rejection::NoGpu);
        }

        let free_mb = match req.gpu_index {
            Some(idx) => live
                .gpu(idx)
                .ok_or(Rejection::GpuIndexMissing(idx))?
                .memory_free_mb,
            None => live.max_free_gpu_memory_mb(),
        };
        if free_mb < req.min_gpu_memory_mb {
            return Err(Rejection::InsufficientGpuMemory {
                free_mb,
                required_mb: req.min_gpu_memory_mb,
            });
        }

        Ok(Candidate {
            view,
            free_gpu_mb: free_mb,
        })
    }
}

/// Best candidate sorts first: priority desc, utilization asc, free GPU
/// memory desc, node id asc.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.view
        .node
        .priority
        .cmp(&a.view.node.priority)
        .then_with(|| utilization(a).cmp(&utilization(b)))
        .then_with(|| b.free_gpu_mb.cmp(&a.free_gpu_mb))
        .then_with(|| a.view.node.id.cmp(&b.view.node.id))
}

/// active/max as an exact fraction. Candidates always have max > 0.
#[derive(Debug, Clone, Copy)]
struct Utilization {
    active: u64,
    max: u64,
}

impl PartialEq for Utilization {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Utilization {}

impl PartialOrd for Utilization {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Utilization {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.active * other.max).cmp(&(other.active * self.max))
    }
}

fn utilization(c: &Candidate) -> Utilization {
    Utilization {
        active: c.view.live.active_kernels as u64,
        max: c.view.node.max_kernels as u64,
    }
}
