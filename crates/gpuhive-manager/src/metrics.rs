use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use gpuhive_common::NodeStatus;

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,

    pub placements_total: AtomicU64,
    pub placement_failures_total: AtomicU64,
    pub gateway_failures_total: AtomicU64,
    pub probes_total: AtomicU64,
    pub probe_failures_total: AtomicU64,
}

impl Metrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition of the counters plus per-status node gauges.
    pub fn render(&self, nodes_by_status: &[(NodeStatus, usize)]) -> String {
        let counters = [
            ("requests_total", &self.requests_total),
            ("requests_inflight", &self.requests_inflight),
            ("responses_2xx", &self.status_2xx),
            ("responses_4xx", &self.status_4xx),
            ("responses_5xx", &self.status_5xx),
            ("placements_total", &self.placements_total),
            ("placement_failures_total", &self.placement_failures_total),
            ("gateway_failures_total", &self.gateway_failures_total),
            ("probes_total", &self.probes_total),
            ("probe_failures_total", &self.probe_failures_total),
        ];

        let mut body = String::new();
        for (name, value) in counters {
            let _ = writeln!(body, "gpuhive_{name} {}", value.load(Ordering::Relaxed));
        }
        for (status, count) in nodes_by_status {
            let _ = writeln!(body, "gpuhive_nodes{{status=\"{status}\"}} {count}");
        }
        body
    }
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let by_status = st.manager.nodes_by_status().await;
    (axum::http::StatusCode::OK, st.metrics.render(&by_status))
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_node_gauges() {
        let m = Metrics::default();
        Metrics::inc(&m.placements_total);
        Metrics::inc(&m.placements_total);
        Metrics::inc(&m.probe_failures_total);

        let text = m.render(&[(NodeStatus::Online, 3), (NodeStatus::Offline, 1)]);
        assert!(text.contains("gpuhive_placements_total 2\n"));
        assert!(text.contains("gpuhive_probe_failures_total 1\n"));
        assert!(text.contains("gpuhive_requests_total 0\n"));
        assert!(text.contains("gpuhive_nodes{status=\"online\"} 3\n"));
        assert!(text.contains("gpuhive_nodes{status=\"offline\"} 1\n"));
    }
}
