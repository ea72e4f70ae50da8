use anyhow::{bail, Context, Result};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Thin wrapper over the manager's HTTP API.
pub struct ManagerClient {
    http: Client,
    base_url: String,
}

impl ManagerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.http.get(self.url(path))).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.http.post(self.url(path)).json(body)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.http.put(self.url(path)).json(body)).await
    }

    /// Sends a request whose success response carries no interesting body.
    pub async fn call(&self, method: Method, path: &str) -> Result<()> {
        let url = self.url(path);
        let resp = self
            .http
            .request(method, &url)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("{}", error_message(status, &resp.text().await.unwrap_or_default()));
        }
        Ok(())
    }

    pub async fn text(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            bail!("{}", error_message(status, &body));
        }
        Ok(body)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await.context("failed to reach the cluster manager")?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            bail!("{}", error_message(status, &body));
        }
        serde_json::from_str(&body).with_context(|| format!("unexpected response: {body}"))
    }
}

/// Pulls `error.message` out of a manager error body, falling back to the raw text.
pub fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    format!("{status}: {message}")
}
