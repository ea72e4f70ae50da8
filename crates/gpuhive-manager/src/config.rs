use std::time::Duration;

use gpuhive_common::DEFAULT_MAX_KERNELS;

/// Runtime knobs of the cluster manager. The binary fills this from
/// command-line flags and environment variables.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Period of the background health cycle.
    pub poll_interval: Duration,
    /// Upper bound for one complete probe of one node.
    pub probe_timeout: Duration,
    /// Upper bound for a kernel start on a gateway.
    pub kernel_timeout: Duration,
    /// Nodes probed in parallel during a cycle.
    pub probe_concurrency: usize,
    /// Capacity given to nodes registered without `max_kernels`.
    pub default_max_kernels: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            kernel_timeout: Duration::from_secs(60),
            probe_concurrency: 8,
            default_max_kernels: DEFAULT_MAX_KERNELS,
        }
    }
}

impl ManagerConfig {
    /// Heartbeat age after which an online node no longer counts as online.
    pub fn stale_after(&self) -> Duration {
        self.poll_interval * 2
    }
}
