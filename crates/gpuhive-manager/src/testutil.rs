use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use gpuhive_common::Node;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::ManagerConfig;

pub fn node(id: &str, name: &str, max_kernels: u32) -> Node {
    Node {
        id: id.to_string(),
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 8888,
        tags: BTreeSet::new(),
        priority: 0,
        max_kernels,
        maintenance: false,
        created_at: Utc::now(),
    }
}

/// A node pointing at a mock gateway.
pub fn node_at(server: &MockServer, name: &str, max_kernels: u32) -> Node {
    let addr = server.address();
    Node {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..node(name, name, max_kernels)
    }
}

/// A local port with nothing listening on it.
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval: Duration::from_secs(30),
        probe_timeout: Duration::from_secs(2),
        kernel_timeout: Duration::from_secs(2),
        probe_concurrency: 4,
        default_max_kernels: 10,
    }
}

/// Mounts a gateway that answers every probe endpoint. `kernels` is the
/// body of `GET /api/kernels`.
pub async fn mount_gateway(server: &MockServer, free_mb: u64, kernels: Value) {
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "2.5.0"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/gpu"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"gpus": [{
            "index": 0, "name": "A10", "memory_total": 24576,
            "memory_used": 24576 - free_mb, "memory_free": free_mb
        }]})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/system"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "cpu_count": 8, "cpu_percent": 3.0,
            "memory_total": 32000, "memory_available": 20000
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/kernels"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kernels))
        .mount(server)
        .await;
}
