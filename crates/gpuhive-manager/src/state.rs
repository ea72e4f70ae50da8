use std::sync::Arc;

use crate::manager::ClusterManager;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ClusterManager>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        let metrics = manager.metrics().clone();
        Self { manager, metrics }
    }
}
