use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use gpuhive_common::{GpuInfo, Node, NodeLiveState, NodeStatus};
use serde_json::{Map, Value};

use crate::error::{GatewayError, ProbeError};
use crate::gateway::GatewayClient;

/// Queries a node's gateway and turns the answers into a `NodeLiveState`.
///
/// `GET /api` decides reachability. GPU, system and kernel endpoints are
/// optional extensions: a gateway without them is still online, it just
/// reports no GPUs, zeroed system figures or unknown kernel usage.
#[derive(Debug, Clone)]
pub struct NodeProbe {
    http: reqwest::Client,
    timeout: Duration,
}

impl NodeProbe {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Probes one node. Only `GET /api` decides reachability; each optional
    /// endpoint has its own bound and a slow one reads as unavailable.
    pub async fn probe(&self, node: &Node) -> Result<NodeLiveState, ProbeError> {
        let probed_at = Utc::now();
        let gateway = GatewayClient::for_node(self.http.clone(), node, self.timeout, self.timeout);

        if let Err(e) = self.bounded(&gateway, "/api", gateway.health()).await {
            return Err(match e {
                source @ GatewayError::Status { .. } => ProbeError::Unhealthy { probed_at, source },
                source => ProbeError::Unreachable { probed_at, source },
            });
        }

        let mut state = self.collect(&gateway, node).await;
        state.probed_at = Some(probed_at);
        state.last_heartbeat = Some(Utc::now());
        Ok(state)
    }

    async fn bounded<T>(
        &self,
        gateway: &GatewayClient,
        path: &str,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(GatewayError::Timeout {
                url: format!("{}{path}", gateway.base_url()),
                timeout: self.timeout,
            }),
        }
    }

    async fn collect(&self, gateway: &GatewayClient, node: &Node) -> NodeLiveState {
        let (gpu, system, kernels) = tokio::join!(
            self.bounded(gateway, "/api/gpu", gateway.gpu_info()),
            self.bounded(gateway, "/api/system", gateway.system_info()),
            self.bounded(gateway, "/api/kernels", gateway.list_kernels())
        );

        let mut state = NodeLiveState {
            status: NodeStatus::Online,
            ..NodeLiveState::offline()
        };

        match gpu {
            Ok(body) => state.gpus = parse_gpus(&body),
            Err(e) => tracing::debug!(node_id=%node.id, error=%e, "gpu info unavailable"),
        }

        match system {
            Ok(body) => apply_system_info(&mut state, &body),
            Err(e) => tracing::debug!(node_id=%node.id, error=%e, "system info unavailable"),
        }

        match kernels {
            Ok(list) => {
                state.active_kernels = list.len() as u32;
                if state.active_kernels >= node.max_kernels {
                    state.status = NodeStatus::Busy;
                }
            }
            // capacity unknown: treat as idle rather than blocking placement
            Err(e) => tracing::debug!(node_id=%node.id, error=%e, "kernel list unavailable"),
        }

        state
    }
}

/// Parses the gateway's GPU report. Accepts `{"gpus": [...]}` or a bare
/// array. Rows that cannot be read are skipped; they never fail the probe.
pub fn parse_gpus(body: &Value) -> Vec<GpuInfo> {
    let rows = match body {
        Value::Array(rows) => rows.as_slice(),
        Value::Object(map) => match map.get("gpus") {
            Some(Value::Array(rows)) => rows.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    let mut gpus = Vec::with_capacity(rows.len());
    for (position, row) in rows.iter().enumerate() {
        match parse_gpu_row(row, position) {
            Ok(gpu) => gpus.push(gpu),
            Err(field) => {
                tracing::warn!(position, field, "skipping unreadable GPU row");
            }
        }
    }
    gpus
}

fn parse_gpu_row(row: &Value, position: usize) -> Result<GpuInfo, &'static str> {
    let Value::Object(obj) = row else {
        return Err("row");
    };

    let index = match number(obj, "index")? {
        Some(i) => i as u32,
        None => position as u32,
    };
    let memory_total_mb = number(obj, "memory_total")?.unwrap_or(0);
    let memory_used_mb = number(obj, "memory_used")?.unwrap_or(0);
    let memory_free_mb = match obj.get("memory_free") {
        None => memory_total_mb.saturating_sub(memory_used_mb),
        Some(_) => number(obj, "memory_free")?.unwrap_or(0),
    };

    Ok(GpuInfo {
        index,
        name: text(obj, "name").unwrap_or_else(|| "Unknown GPU".to_string()),
        memory_total_mb,
        memory_used_mb,
        memory_free_mb,
        utilization_pct: number(obj, "utilization")?.unwrap_or(0).min(100) as u32,
        temperature_c: number(obj, "temperature")?.unwrap_or(0) as u32,
        power_w: float(obj, "power_usage")?.unwrap_or(0.0),
        driver_version: text(obj, "driver_version").unwrap_or_default(),
        cuda_version: text(obj, "cuda_version").unwrap_or_default(),
    })
}

fn apply_system_info(state: &mut NodeLiveState, body: &Value) {
    let Value::Object(obj) = body else {
        return;
    };
    state.cpu_count = number(obj, "cpu_count").ok().flatten().unwrap_or(0) as u32;
    state.cpu_percent = float(obj, "cpu_percent").ok().flatten().unwrap_or(0.0);
    state.memory_total_mb = number(obj, "memory_total").ok().flatten().unwrap_or(0);
    state.memory_available_mb = number(obj, "memory_available").ok().flatten().unwrap_or(0);
}

fn text(obj: &Map<String, Value>, field: &'static str) -> Option<String> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Non-negative whole number. `Ok(None)` means "not reported".
fn number(obj: &Map<String, Value>, field: &'static str) -> Result<Option<u64>, &'static str> {
    match float(obj, field)? {
        None => Ok(None),
        Some(v) if v >= 0.0 => Ok(Some(v.round() as u64)),
        Some(_) => Err(field),
    }
}

/// Lenient float reading. Absent, null, empty and nvidia-smi placeholders
/// such as `[N/A]` read as not reported. Strings may carry a unit suffix
/// ("24576 MiB", "250.3 W").
fn float(obj: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, &'static str> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()).map(Some).ok_or(field),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || is_placeholder(s) {
                return Ok(None);
            }
            let head = s.split_whitespace().next().unwrap_or(s);
            let head = head.trim_end_matches('%');
            head.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Some)
                .ok_or(field)
        }
        Some(_) => Err(field),
    }
}

fn is_placeholder(s: &str) -> bool {
    let s = s.trim_start_matches('[').trim_end_matches(']');
    s.eq_ignore_ascii_case("n/a") || s.eq_ignore_ascii_case("not supported")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{node_at, unused_port};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_wrapped_and_bare_gpu_lists() {
        let row = json!({
            "index": 0, "name": "NVIDIA A100", "memory_total": 40960,
            "memory_used": 1024, "memory_free": 39936, "utilization": 12,
            "temperature": 41, "power_usage": 63.5,
            "driver_version": "535.104", "cuda_version": "12.2"
        });
        let wrapped = parse_gpus(&json!({ "gpus": [row.clone()] }));
        let bare = parse_gpus(&json!([row]));
        assert_eq!(wrapped, bare);
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].memory_free_mb, 39936);
        assert_eq!(wrapped[0].power_w, 63.5);
        assert_eq!(wrapped[0].cuda_version, "12.2");
    }

    #[test]
    fn tolerates_placeholders_and_units() {
        let gpus = parse_gpus(&json!({ "gpus": [{
            "index": "1",
            "name": "Tesla T4",
            "memory_total": "15360 MiB",
            "memory_used": "[N/A]",
            "memory_free": "15000 MiB",
            "utilization": "37 %",
            "temperature": null,
            "power_usage": "[Not Supported]"
        }]}));
        assert_eq!(gpus.len(), 1);
        let g = &gpus[0];
        assert_eq!(g.index, 1);
        assert_eq!(g.memory_total_mb, 15360);
        assert_eq!(g.memory_used_mb, 0);
        assert_eq!(g.memory_free_mb, 15000);
        assert_eq!(g.utilization_pct, 37);
        assert_eq!(g.temperature_c, 0);
        assert_eq!(g.power_w, 0.0);
    }

    #[test]
    fn skips_unreadable_rows_and_derives_free_memory() {
        let gpus = parse_gpus(&json!([
            { "memory_total": "lots", "name": "broken" },
            "not an object",
            { "memory_total": 24576, "memory_used": 4096 }
        ]));
        assert_eq!(gpus.len(), 1);
        // index falls back to the row position
        assert_eq!(gpus[0].index, 2);
        assert_eq!(gpus[0].name, "Unknown GPU");
        assert_eq!(gpus[0].memory_free_mb, 20480);
    }

    #[test]
    fn unexpected_shapes_yield_no_gpus() {
        assert!(parse_gpus(&json!("nvidia-smi not found")).is_empty());
        assert!(parse_gpus(&json!({ "error": "no driver" })).is_empty());
    }

    async fn healthy_gateway(kernels: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "2.5.0"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/gpu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"gpus": [
                {"index": 0, "name": "L4", "memory_total": 23034, "memory_used": 34}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/system"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cpu_count": 16, "cpu_percent": 7.5,
                "memory_total": 64000, "memory_available": 48000
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/kernels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(kernels))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn healthy_gateway_reports_online() {
        let server = healthy_gateway(json!([{"id": "k-1"}])).await;
        let probe = NodeProbe::new(reqwest::Client::new(), Duration::from_secs(2));
        let node = node_at(&server, "gpu-a", 4);

        let state = probe.probe(&node).await.unwrap();
        assert_eq!(state.status, NodeStatus::Online);
        assert_eq!(state.active_kernels, 1);
        assert_eq!(state.gpus.len(), 1);
        assert_eq!(state.gpus[0].memory_free_mb, 23000);
        assert_eq!(state.cpu_count, 16);
        assert_eq!(state.memory_available_mb, 48000);
        assert!(state.last_heartbeat >= state.probed_at);
    }

    #[tokio::test]
    async fn full_node_reports_busy() {
        let server = healthy_gateway(json!([{"id": "k-1"}, {"id": "k-2"}])).await;
        let probe = NodeProbe::new(reqwest::Client::new(), Duration::from_secs(2));
        let node = node_at(&server, "gpu-a", 2);

        let state = probe.probe(&node).await.unwrap();
        assert_eq!(state.status, NodeStatus::Busy);
        assert_eq!(state.active_kernels, 2);
    }

    #[tokio::test]
    async fn missing_extensions_still_online() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        // every other path answers 404

        let probe = NodeProbe::new(reqwest::Client::new(), Duration::from_secs(2));
        let state = probe.probe(&node_at(&server, "plain", 4)).await.unwrap();
        assert_eq!(state.status, NodeStatus::Online);
        assert!(state.gpus.is_empty());
        assert_eq!(state.active_kernels, 0);
        assert_eq!(state.cpu_count, 0);
    }

    #[tokio::test]
    async fn error_status_marks_node_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = NodeProbe::new(reqwest::Client::new(), Duration::from_secs(2));
        let err = probe.probe(&node_at(&server, "sick", 4)).await.unwrap_err();
        assert_eq!(err.status(), NodeStatus::Error);
        let state = err.to_state();
        assert_eq!(state.status, NodeStatus::Error);
        assert!(state.last_heartbeat.is_none());
        assert!(state.probed_at.is_some());
    }

    #[tokio::test]
    async fn unreachable_gateway_is_offline() {
        let mut node = node_at_port("127.0.0.1", unused_port());
        node.name = "gone".to_string();
        let probe = NodeProbe::new(reqwest::Client::new(), Duration::from_secs(2));
        let err = probe.probe(&node).await.unwrap_err();
        assert_eq!(err.status(), NodeStatus::Offline);
    }

    #[tokio::test]
    async fn slow_gateway_times_out_as_offline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let probe = NodeProbe::new(reqwest::Client::new(), Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = probe.probe(&node_at(&server, "slow", 4)).await.unwrap_err();
        assert_eq!(err.status(), NodeStatus::Offline);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stalled_gpu_endpoint_keeps_node_online() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "2.5.0"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/gpu"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"gpus": [{"index": 0, "memory_total": 1000}]}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/kernels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "k-1"}])))
            .mount(&server)
            .await;

        let probe = NodeProbe::new(reqwest::Client::new(), Duration::from_millis(500));
        let started = std::time::Instant::now();
        let state = probe.probe(&node_at(&server, "stuck-gpu", 4)).await.unwrap();
        assert_eq!(state.status, NodeStatus::Online);
        assert!(state.gpus.is_empty());
        assert_eq!(state.active_kernels, 1);
        assert_eq!(state.cpu_count, 0);
        assert!(state.last_heartbeat.is_some());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    fn node_at_port(host: &str, port: u16) -> Node {
        Node {
            host: host.to_string(),
            port,
            ..crate::testutil::node("n-1", "n-1", 4)
        }
    }
}
