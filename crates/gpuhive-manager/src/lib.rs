pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod probe;
pub mod registry;
pub mod state;

pub use config::ManagerConfig;
pub use error::{ClusterError, GatewayError, ProbeError};
pub use manager::ClusterManager;
pub use monitor::HealthMonitor;
pub use probe::NodeProbe;
pub use registry::NodeRegistry;

#[cfg(test)]
pub(crate) mod testutil;
