use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use gpuhive_common::{
    ClusterSnapshot, ClusterStats, CreateKernelRequest, KernelLaunch, KernelLocation, Node,
    NodeId, NodeSpec, NodeStatus, NodeUpdate, NodeView, PlacementRequest,
};
use gpuhive_meta::MetaStore;
use gpuhive_scheduler::PlacementEngine;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, GatewayError};
use crate::gateway::GatewayClient;
use crate::metrics::Metrics;
use crate::monitor::HealthMonitor;
use crate::probe::NodeProbe;
use crate::registry::NodeRegistry;
use crate::ManagerConfig;

/// Environment variable that pins a kernel to one GPU.
const GPU_PIN_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Front door of the cluster: node administration, placement and kernel
/// lifecycle routing.
pub struct ClusterManager {
    config: ManagerConfig,
    registry: Arc<NodeRegistry>,
    monitor: Arc<HealthMonitor>,
    engine: PlacementEngine,
    http: reqwest::Client,
    /// Kernels started through this manager, by kernel id.
    kernels: DashMap<String, NodeId>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl ClusterManager {
    /// Loads the registry from `store`. Every loaded node starts offline until
    /// the first health cycle reaches it.
    pub async fn open(
        store: Arc<dyn MetaStore>,
        config: ManagerConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = NodeRegistry::load(store).await?;
        Self::with_registry(registry, config)
    }

    pub fn with_registry(
        registry: NodeRegistry,
        config: ManagerConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.probe_timeout)
            .build()?;
        let metrics = Arc::new(Metrics::default());
        let registry = Arc::new(registry);
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            NodeProbe::new(http.clone(), config.probe_timeout),
            &config,
            metrics.clone(),
        ));
        let engine = PlacementEngine::new(config.stale_after());

        Ok(Arc::new(Self {
            config,
            registry,
            monitor,
            engine,
            http,
            kernels: DashMap::new(),
            metrics,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Seeds live state for loaded nodes and spawns the health loop.
    pub async fn start(&self) -> JoinHandle<()> {
        self.registry
            .with_nodes(|nodes| {
                for node in nodes {
                    self.monitor.seed(&node.id);
                }
            })
            .await;
        tokio::spawn(self.monitor.clone().run(self.shutdown.clone()))
    }

    /// Stops the health loop. Probes in flight finish or time out on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn snapshot(&self) -> ClusterSnapshot {
        self.monitor.snapshot().await
    }

    /// Snapshot as callers see it: stale heartbeats already folded into
    /// each node's status, matching what placement decides on.
    async fn observed(&self) -> ClusterSnapshot {
        self.snapshot()
            .await
            .with_effective_status(self.config.stale_after())
    }

    // ---- node administration ----

    /// Registers a node and probes it once before returning.
    pub async fn add_node(&self, spec: NodeSpec) -> Result<NodeView, ClusterError> {
        let node = self.validate(spec)?;
        let id = self
            .registry
            .insert_with(node, |n| self.monitor.seed(&n.id))
            .await?;
        let view = self.refresh_node(&id).await?;
        tracing::info!(
            node_id=%id,
            node=%view.node.name,
            host=%view.node.host,
            port=view.node.port,
            status=%view.live.status,
            "node added"
        );
        Ok(view)
    }

    /// Unregisters a node after shutting down the kernels it runs.
    pub async fn remove_node(&self, node_id: &str) -> Result<Node, ClusterError> {
        let node = self.registry.get(node_id).await?;
        self.terminate_kernels(&node).await;

        let removed = self
            .registry
            .remove_with(node_id, |n| self.monitor.discard(&n.id))
            .await?;
        self.kernels.retain(|_, owner| owner != node_id);
        tracing::info!(node_id=%removed.id, node=%removed.name, "node removed");
        Ok(removed)
    }

    pub async fn update_node(
        &self,
        node_id: &str,
        update: NodeUpdate,
    ) -> Result<NodeView, ClusterError> {
        let update = validate_update(update)?;
        if update.is_empty() {
            return self.get_node(node_id).await;
        }
        let node = self.registry.update(node_id, &update).await?;
        tracing::info!(
            node_id=%node.id,
            node=%node.name,
            maintenance=node.maintenance,
            "node updated"
        );
        // re-probe so maintenance and capacity changes take effect now
        self.refresh_node(node_id).await
    }

    pub async fn get_node(&self, node_id: &str) -> Result<NodeView, ClusterError> {
        self.observed()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))
    }

    pub async fn list_nodes(&self) -> Vec<NodeView> {
        self.observed().await.nodes
    }

    pub async fn refresh_node(&self, node_id: &str) -> Result<NodeView, ClusterError> {
        self.monitor.refresh_one(node_id).await?;
        self.get_node(node_id).await
    }

    pub async fn refresh_all(&self) -> Vec<NodeView> {
        self.monitor.refresh_all().await;
        self.list_nodes().await
    }

    pub async fn stats(&self) -> ClusterStats {
        self.observed().await.stats()
    }

    pub async fn nodes_by_status(&self) -> Vec<(NodeStatus, usize)> {
        self.observed().await.count_by_status()
    }

    // ---- kernels ----

    /// Places a kernel on the best eligible node and starts it there.
    ///
    /// The gateway call is not retried on another node: a failure is reported
    /// to the caller as is.
    pub async fn create_kernel(
        &self,
        req: &CreateKernelRequest,
    ) -> Result<KernelLaunch, ClusterError> {
        let snapshot = self.snapshot().await;
        let node_id = match self.engine.select(&req.placement, &snapshot) {
            Ok(id) => id,
            Err(e) => {
                Metrics::inc(&self.metrics.placement_failures_total);
                tracing::warn!(error=%e, "kernel placement failed");
                return Err(e.into());
            }
        };
        Metrics::inc(&self.metrics.placements_total);

        let node = snapshot
            .get(&node_id)
            .map(|v| v.node.clone())
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.clone()))?;

        let mut env = req.env.clone();
        if let Some(index) = req.placement.gpu_index {
            env.insert(GPU_PIN_ENV.to_string(), index.to_string());
        }

        let kernel = self
            .gateway(&node)
            .create_kernel(&req.kernel_name, &env)
            .await
            .map_err(|source| {
                Metrics::inc(&self.metrics.gateway_failures_total);
                tracing::warn!(
                    node_id=%node.id,
                    node=%node.name,
                    error=%source,
                    "kernel start failed"
                );
                ClusterError::Gateway {
                    node_id: node.id.clone(),
                    source,
                }
            })?;

        let kernel_id = kernel
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.kernels.insert(kernel_id.clone(), node.id.clone());
        tracing::info!(
            %kernel_id,
            node_id=%node.id,
            node=%node.name,
            kernel_name=%req.kernel_name,
            "kernel started"
        );

        // pick up the new kernel count before the next placement decision
        if let Err(e) = self.monitor.refresh_one(&node.id).await {
            tracing::debug!(node_id=%node.id, error=%e, "post-start refresh skipped");
        }

        Ok(KernelLaunch {
            kernel_id,
            node_id: node.id,
            node_name: node.name,
            kernel,
        })
    }

    /// Starts a kernel on a named node, still subject to its hard constraints.
    pub async fn create_kernel_on_node(
        &self,
        node_id: &str,
        kernel_name: &str,
    ) -> Result<KernelLaunch, ClusterError> {
        let req = CreateKernelRequest {
            placement: PlacementRequest {
                node_id: Some(node_id.to_string()),
                require_gpu: false,
                ..Default::default()
            },
            kernel_name: kernel_name.to_string(),
            ..Default::default()
        };
        self.create_kernel(&req).await
    }

    /// Node that hosts a kernel started through this manager.
    pub async fn locate_kernel(&self, kernel_id: &str) -> Result<NodeView, ClusterError> {
        let node = self.kernel_node(kernel_id).await?;
        self.get_node(&node.id).await
    }

    pub async fn kernel_location(&self, kernel_id: &str) -> Result<KernelLocation, ClusterError> {
        let node = self.kernel_node(kernel_id).await?;
        Ok(KernelLocation {
            kernel_id: kernel_id.to_string(),
            websocket_url: self.gateway(&node).websocket_url(kernel_id),
            node_id: node.id,
        })
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), ClusterError> {
        let node = self.kernel_node(kernel_id).await?;
        self.gateway(&node)
            .interrupt_kernel(kernel_id)
            .await
            .map_err(|source| self.gateway_error(&node, source))
    }

    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<(), ClusterError> {
        let node = self.kernel_node(kernel_id).await?;
        self.gateway(&node)
            .restart_kernel(kernel_id)
            .await
            .map_err(|source| self.gateway_error(&node, source))
    }

    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ClusterError> {
        let node = self.kernel_node(kernel_id).await?;
        self.gateway(&node)
            .shutdown_kernel(kernel_id)
            .await
            .map_err(|source| self.gateway_error(&node, source))?;
        self.kernels.remove(kernel_id);
        tracing::info!(%kernel_id, node_id=%node.id, "kernel shut down");
        Ok(())
    }

    // ---- internals ----

    fn gateway(&self, node: &Node) -> GatewayClient {
        GatewayClient::for_node(
            self.http.clone(),
            node,
            self.config.probe_timeout,
            self.config.kernel_timeout,
        )
    }

    fn gateway_error(&self, node: &Node, source: GatewayError) -> ClusterError {
        Metrics::inc(&self.metrics.gateway_failures_total);
        ClusterError::Gateway {
            node_id: node.id.clone(),
            source,
        }
    }

    async fn kernel_node(&self, kernel_id: &str) -> Result<Node, ClusterError> {
        let node_id = self
            .kernels
            .get(kernel_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClusterError::KernelNotFound(kernel_id.to_string()))?;
        match self.registry.get(&node_id).await {
            Ok(node) => Ok(node),
            Err(ClusterError::NodeNotFound(_)) => {
                self.kernels.remove(kernel_id);
                Err(ClusterError::KernelNotFound(kernel_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Best effort: shuts down every kernel known to run on `node`, both the
    /// ones started here and the ones the gateway lists.
    async fn terminate_kernels(&self, node: &Node) {
        let gateway = self.gateway(node);

        let mut ids: BTreeSet<String> = self
            .kernels
            .iter()
            .filter(|e| e.value() == &node.id)
            .map(|e| e.key().clone())
            .collect();
        match gateway.list_kernels().await {
            Ok(listed) => ids.extend(
                listed
                    .iter()
                    .filter_map(|k| k.get("id").and_then(Value::as_str))
                    .map(str::to_string),
            ),
            Err(e) => {
                tracing::debug!(node_id=%node.id, error=%e, "could not list kernels before removal")
            }
        }
        if ids.is_empty() {
            return;
        }

        let results =
            futures_util::future::join_all(ids.iter().map(|id| gateway.shutdown_kernel(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    node_id=%node.id,
                    kernel_id=%id,
                    error=%e,
                    "failed to shut down kernel on removed node"
                );
            }
        }
    }

    fn validate(&self, spec: NodeSpec) -> Result<Node, ClusterError> {
        let host = spec.host.trim();
        if host.is_empty() {
            return Err(ClusterError::Config("host must not be empty".to_string()));
        }
        if host.contains("://") || host.contains('/') || host.chars().any(char::is_whitespace) {
            return Err(ClusterError::Config(format!(
                "host '{host}' must be a bare hostname or IP address"
            )));
        }
        if spec.port == 0 {
            return Err(ClusterError::Config("port must be between 1 and 65535".to_string()));
        }
        let max_kernels = spec.max_kernels.unwrap_or(self.config.default_max_kernels);
        if max_kernels == 0 {
            return Err(ClusterError::Config("max_kernels must be at least 1".to_string()));
        }

        let name = match spec.name.trim() {
            "" => format!("{host}:{}", spec.port),
            name => name.to_string(),
        };

        Ok(Node {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            host: host.to_string(),
            port: spec.port,
            tags: clean_tags(&spec.tags),
            priority: spec.priority,
            max_kernels,
            maintenance: false,
            created_at: Utc::now(),
        })
    }
}

fn clean_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_update(mut update: NodeUpdate) -> Result<NodeUpdate, ClusterError> {
    if update.port == Some(0) {
        return Err(ClusterError::Config("port must be between 1 and 65535".to_string()));
    }
    if update.max_kernels == Some(0) {
        return Err(ClusterError::Config("max_kernels must be at least 1".to_string()));
    }
    if let Some(name) = &update.name {
        if name.trim().is_empty() {
            return Err(ClusterError::Config("name must not be empty".to_string()));
        }
        update.name = Some(name.trim().to_string());
    }
    if let Some(tags) = &update.tags {
        update.tags = Some(clean_tags(tags).into_iter().collect());
    }
    Ok(update)
}
