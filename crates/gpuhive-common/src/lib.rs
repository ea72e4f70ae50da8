pub mod cluster;
pub mod kernel;
pub mod node;
pub mod node_status;
pub mod placement;

pub use cluster::{ClusterSnapshot, ClusterStats, NodeView};
pub use kernel::{CreateKernelRequest, KernelLaunch, KernelLocation};
pub use node::{Node, NodeId, NodeSpec, NodeUpdate, DEFAULT_GATEWAY_PORT, DEFAULT_MAX_KERNELS};
pub use node_status::{GpuInfo, NodeLiveState, NodeStatus};
pub use placement::PlacementRequest;

pub mod telemetry;
