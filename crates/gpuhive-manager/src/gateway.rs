use std::collections::BTreeMap;
use std::time::Duration;

use gpuhive_common::Node;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use crate::error::GatewayError;

/// HTTP client for one node's kernel gateway.
///
/// Probe calls are bounded by `probe_timeout`, kernel lifecycle calls by
/// `kernel_timeout`. The underlying `reqwest::Client` is shared by every
/// gateway client the manager creates.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    kernel_timeout: Duration,
}

impl GatewayClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        probe_timeout: Duration,
        kernel_timeout: Duration,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout,
            kernel_timeout,
        }
    }

    pub fn for_node(
        http: reqwest::Client,
        node: &Node,
        probe_timeout: Duration,
        kernel_timeout: Duration,
    ) -> Self {
        Self::new(http, node.base_url(), probe_timeout, kernel_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `ws://` URL of a kernel's channels endpoint on this gateway.
    pub fn websocket_url(&self, kernel_id: &str) -> String {
        let authority = self
            .base_url
            .strip_prefix("http://")
            .or_else(|| self.base_url.strip_prefix("https://"))
            .unwrap_or(&self.base_url);
        let scheme = if self.base_url.starts_with("https://") {
            "wss"
        } else {
            "ws"
        };
        format!("{scheme}://{authority}/api/kernels/{kernel_id}/channels")
    }

    /// Liveness check against `GET /api`. Returns the gateway's version string
    /// when it reports one.
    pub async fn health(&self) -> Result<Option<String>, GatewayError> {
        let body = self.get_json("/api").await?;
        match body {
            Value::Object(map) => Ok(map
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string)),
            other => Err(GatewayError::Malformed {
                url: self.url("/api"),
                reason: format!("expected a JSON object, got {other}"),
            }),
        }
    }

    pub async fn gpu_info(&self) -> Result<Value, GatewayError> {
        self.get_json("/api/gpu").await
    }

    pub async fn system_info(&self) -> Result<Value, GatewayError> {
        self.get_json("/api/system").await
    }

    /// Kernels currently running on the gateway, as raw JSON objects.
    pub async fn list_kernels(&self) -> Result<Vec<Value>, GatewayError> {
        match self.get_json("/api/kernels").await? {
            Value::Array(kernels) => Ok(kernels),
            other => Err(GatewayError::Malformed {
                url: self.url("/api/kernels"),
                reason: format!("expected a JSON array, got {other}"),
            }),
        }
    }

    /// Starts a kernel. The returned object carries at least a string `id`.
    pub async fn create_kernel(
        &self,
        kernel_name: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<Value, GatewayError> {
        let url = self.url("/api/kernels");
        let body = json!({ "name": kernel_name, "env": env });
        let req = self
            .http
            .post(&url)
            .timeout(self.kernel_timeout)
            .json(&body);
        let resp = self.send(&url, req, self.kernel_timeout).await?;
        let kernel: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Malformed {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        match kernel.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(kernel),
            _ => Err(GatewayError::Malformed {
                url,
                reason: "kernel response has no id".to_string(),
            }),
        }
    }

    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), GatewayError> {
        self.kernel_call(Method::DELETE, &format!("/api/kernels/{kernel_id}"))
            .await
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), GatewayError> {
        self.kernel_call(
            Method::POST,
            &format!("/api/kernels/{kernel_id}/interrupt"),
        )
        .await
    }

    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<(), GatewayError> {
        self.kernel_call(Method::POST, &format!("/api/kernels/{kernel_id}/restart"))
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn kernel_call(&self, method: Method, path: &str) -> Result<(), GatewayError> {
        let url = self.url(path);
        let req = self
            .http
            .request(method, &url)
            .timeout(self.kernel_timeout);
        self.send(&url, req, self.kernel_timeout).await?;
        Ok(())
    }

    async fn get_json(&self, path: &str) -> Result<Value, GatewayError> {
        let url = self.url(path);
        let req = self.http.get(&url).timeout(self.probe_timeout);
        let resp = self.send(&url, req, self.probe_timeout).await?;
        resp.json().await.map_err(|e| GatewayError::Malformed {
            url,
            reason: e.to_string(),
        })
    }

    async fn send(
        &self,
        url: &str,
        req: RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let resp = req.send().await.map_err(|source| {
            if source.is_timeout() {
                GatewayError::Timeout {
                    url: url.to_string(),
                    timeout,
                }
            } else {
                GatewayError::Request {
                    url: url.to_string(),
                    source,
                }
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(GatewayError::Status {
            url: url.to_string(),
            status,
            body: truncate(&body, 256),
        })
    }
}

impl GatewayError {
    /// The gateway answered, but with an error status.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str) -> GatewayClient {
        GatewayClient::new(
            reqwest::Client::new(),
            base_url,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn websocket_url_swaps_scheme() {
        let c = client("http://10.0.0.7:8888/");
        assert_eq!(
            c.websocket_url("k-1"),
            "ws://10.0.0.7:8888/api/kernels/k-1/channels"
        );
        let c = client("https://gw.internal:443");
        assert_eq!(
            c.websocket_url("k-2"),
            "wss://gw.internal:443/api/kernels/k-2/channels"
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[tokio::test]
    async fn create_kernel_sends_name_and_env() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/kernels"))
            .and(body_partial_json(json!({
                "name": "python3",
                "env": {"CUDA_VISIBLE_DEVICES": "1"}
            })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"id": "k-1", "name": "python3"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut env = BTreeMap::new();
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), "1".to_string());
        let kernel = client(&server.uri())
            .create_kernel("python3", &env)
            .await
            .unwrap();
        assert_eq!(kernel["id"], "k-1");
    }

    #[tokio::test]
    async fn create_kernel_without_id_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/kernels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "python3"})))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .create_kernel("python3", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Malformed { .. }), "{err}");
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/kernels/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such kernel"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .shutdown_kernel("missing")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(err.to_string().contains("no such kernel"));
    }

    #[tokio::test]
    async fn health_requires_json_object() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "2.5.0"})))
            .mount(&server)
            .await;
        assert_eq!(
            client(&server.uri()).health().await.unwrap().as_deref(),
            Some("2.5.0")
        );

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
            .mount(&server)
            .await;
        let err = client(&server.uri()).health().await.unwrap_err();
        assert!(matches!(err, GatewayError::Malformed { .. }));
    }
}
