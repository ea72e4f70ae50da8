use std::time::Duration;

use chrono::{DateTime, Utc};
use gpuhive_common::{NodeId, NodeLiveState, NodeStatus};
use gpuhive_scheduler::NoEligibleNode;

/// Failure of a single HTTP call to a node's kernel gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} did not answer within {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("unexpected response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

/// A health probe that did not produce a usable reading.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Network error, timeout or garbage on the liveness endpoint.
    #[error("gateway unreachable: {source}")]
    Unreachable {
        probed_at: DateTime<Utc>,
        #[source]
        source: GatewayError,
    },
    /// The gateway answered its liveness endpoint with an error status.
    #[error("gateway unhealthy: {source}")]
    Unhealthy {
        probed_at: DateTime<Utc>,
        #[source]
        source: GatewayError,
    },
}

impl ProbeError {
    pub fn status(&self) -> NodeStatus {
        match self {
            ProbeError::Unreachable { .. } => NodeStatus::Offline,
            ProbeError::Unhealthy { .. } => NodeStatus::Error,
        }
    }

    pub fn probed_at(&self) -> DateTime<Utc> {
        match self {
            ProbeError::Unreachable { probed_at, .. } | ProbeError::Unhealthy { probed_at, .. } => {
                *probed_at
            }
        }
    }

    /// The live state this failure is recorded as. The heartbeat stays unset.
    pub fn to_state(&self) -> NodeLiveState {
        NodeLiveState {
            status: self.status(),
            probed_at: Some(self.probed_at()),
            ..NodeLiveState::offline()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("invalid node configuration: {0}")]
    Config(String),

    #[error("node '{0}' not found")]
    NodeNotFound(NodeId),

    #[error("node '{0}' is already registered")]
    DuplicateNode(NodeId),

    #[error("kernel '{0}' not found")]
    KernelNotFound(String),

    #[error(transparent)]
    NoEligibleNode(#[from] NoEligibleNode),

    #[error("gateway call to node '{node_id}' failed: {source}")]
    Gateway {
        node_id: NodeId,
        #[source]
        source: GatewayError,
    },

    #[error("registry storage error: {0:#}")]
    Storage(anyhow::Error),
}
