use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use gpuhive_common::kernel::DEFAULT_KERNEL_NAME;
use gpuhive_common::{CreateKernelRequest, NodeSpec, NodeUpdate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::ClusterError;
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    details: Option<serde_json::Value>,
) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
            request_id: format!("req_{}", Uuid::new_v4()),
            details,
        },
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match &self {
            ClusterError::Config(_) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_config", &message, None)
            }
            ClusterError::NodeNotFound(_) => {
                error_response(StatusCode::NOT_FOUND, "node_not_found", &message, None)
            }
            ClusterError::KernelNotFound(_) => {
                error_response(StatusCode::NOT_FOUND, "kernel_not_found", &message, None)
            }
            ClusterError::DuplicateNode(_) => {
                error_response(StatusCode::CONFLICT, "duplicate_node", &message, None)
            }
            ClusterError::NoEligibleNode(e) => {
                let rejections: Vec<_> = e
                    .rejections
                    .iter()
                    .map(|(node_id, reason)| {
                        json!({"node_id": node_id, "reason": reason.to_string()})
                    })
                    .collect();
                error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "no_eligible_node",
                    &message,
                    Some(json!({ "rejections": rejections })),
                )
            }
            ClusterError::Gateway { node_id, .. } => error_response(
                StatusCode::BAD_GATEWAY,
                "gateway_error",
                &message,
                Some(json!({ "node_id": node_id })),
            ),
            ClusterError::Storage(_) => {
                tracing::error!(error=%message, "registry storage failure");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    &message,
                    None,
                )
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ClusterError>;

pub fn router(st: AppState) -> Router {
    let cluster_routes = Router::new()
        .route("/cluster/nodes", get(list_nodes).post(add_node))
        .route(
            "/cluster/nodes/:node_id",
            get(get_node).put(update_node).delete(remove_node),
        )
        .route("/cluster/nodes/:node_id/refresh", post(refresh_node))
        .route("/cluster/nodes/:node_id/kernels", post(create_kernel_on_node))
        .route("/cluster/refresh", post(refresh_all))
        .route("/cluster/stats", get(stats))
        .route("/cluster/kernels", post(create_kernel))
        .route("/cluster/kernels/:kernel_id", delete(shutdown_kernel))
        .route("/cluster/kernels/:kernel_id/node", get(locate_kernel))
        .route("/cluster/kernels/:kernel_id/interrupt", post(interrupt_kernel))
        .route("/cluster/kernels/:kernel_id/restart", post(restart_kernel))
        .route("/cluster/kernels/:kernel_id/websocket", get(kernel_websocket));

    let public_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler));

    public_routes
        .merge(cluster_routes)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn list_nodes(State(st): State<AppState>) -> Json<Vec<gpuhive_common::NodeView>> {
    Json(st.manager.list_nodes().await)
}

async fn add_node(
    State(st): State<AppState>,
    Json(spec): Json<NodeSpec>,
) -> Result<impl IntoResponse, ClusterError> {
    let view = st.manager.add_node(spec).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_node(
    State(st): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<gpuhive_common::NodeView> {
    Ok(Json(st.manager.get_node(&node_id).await?))
}

async fn update_node(
    State(st): State<AppState>,
    Path(node_id): Path<String>,
    Json(update): Json<NodeUpdate>,
) -> ApiResult<gpuhive_common::NodeView> {
    Ok(Json(st.manager.update_node(&node_id, update).await?))
}

async fn remove_node(
    State(st): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let node = st.manager.remove_node(&node_id).await?;
    Ok(Json(json!({ "status": "removed", "node_id": node.id })))
}

async fn refresh_node(
    State(st): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<gpuhive_common::NodeView> {
    Ok(Json(st.manager.refresh_node(&node_id).await?))
}

async fn refresh_all(State(st): State<AppState>) -> Json<Vec<gpuhive_common::NodeView>> {
    Json(st.manager.refresh_all().await)
}

async fn stats(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.manager.stats().await)
}

async fn create_kernel(
    State(st): State<AppState>,
    Json(req): Json<CreateKernelRequest>,
) -> ApiResult<gpuhive_common::KernelLaunch> {
    Ok(Json(st.manager.create_kernel(&req).await?))
}

#[derive(Debug, Deserialize)]
struct KernelNameQuery {
    #[serde(default = "default_kernel_name")]
    kernel_name: String,
}

fn default_kernel_name() -> String {
    DEFAULT_KERNEL_NAME.to_string()
}

async fn create_kernel_on_node(
    State(st): State<AppState>,
    Path(node_id): Path<String>,
    Query(q): Query<KernelNameQuery>,
) -> ApiResult<gpuhive_common::KernelLaunch> {
    Ok(Json(
        st.manager
            .create_kernel_on_node(&node_id, &q.kernel_name)
            .await?,
    ))
}

async fn locate_kernel(
    State(st): State<AppState>,
    Path(kernel_id): Path<String>,
) -> ApiResult<gpuhive_common::NodeView> {
    Ok(Json(st.manager.locate_kernel(&kernel_id).await?))
}

async fn kernel_websocket(
    State(st): State<AppState>,
    Path(kernel_id): Path<String>,
) -> ApiResult<gpuhive_common::KernelLocation> {
    Ok(Json(st.manager.kernel_location(&kernel_id).await?))
}

async fn interrupt_kernel(
    State(st): State<AppState>,
    Path(kernel_id): Path<String>,
) -> Result<StatusCode, ClusterError> {
    st.manager.interrupt_kernel(&kernel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_kernel(
    State(st): State<AppState>,
    Path(kernel_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    st.manager.restart_kernel(&kernel_id).await?;
    Ok(Json(json!({ "status": "restarted", "kernel_id": kernel_id })))
}

async fn shutdown_kernel(
    State(st): State<AppState>,
    Path(kernel_id): Path<String>,
) -> Result<StatusCode, ClusterError> {
    st.manager.shutdown_kernel(&kernel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use gpuhive_meta::MemoryMetaStore;
    use serde_json::Value;
    use tower::ServiceExt;
    use wiremock::MockServer;

    use super::*;
    use crate::testutil::{fast_config, mount_gateway};
    use crate::ClusterManager;

    async fn app() -> Router {
        let manager = ClusterManager::open(Arc::new(MemoryMetaStore::new()), fast_config())
            .await
            .unwrap();
        router(AppState::new(manager))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn empty_cluster_has_zero_stats() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/cluster/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_nodes"], 0);
        assert_eq!(body["max_kernels"], 0);

        let (status, body) = call(&app, "GET", "/cluster/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn errors_use_structured_body() {
        let app = app().await;

        let (status, body) = call(&app, "POST", "/cluster/nodes", Some(json!({"host": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_config");
        assert!(body["error"]["request_id"].as_str().unwrap().starts_with("req_"));

        let (status, body) = call(&app, "GET", "/cluster/nodes/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "node_not_found");

        let (status, body) = call(&app, "POST", "/cluster/kernels", Some(json!({}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "no_eligible_node");

        let (status, body) = call(&app, "DELETE", "/cluster/kernels/k-404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "kernel_not_found");
    }

    #[tokio::test]
    async fn node_round_trip_over_http() {
        let server = MockServer::start().await;
        mount_gateway(&server, 16000, json!([])).await;
        let app = app().await;

        let (status, created) = call(
            &app,
            "POST",
            "/cluster/nodes",
            Some(json!({
                "name": "gpu-a",
                "host": server.address().ip().to_string(),
                "port": server.address().port(),
                "tags": ["a10"],
                "max_kernels": 3
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "online");
        assert_eq!(created["gpus"][0]["memory_free_mb"], 16000);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, updated) = call(
            &app,
            "PUT",
            &format!("/cluster/nodes/{id}"),
            Some(json!({"priority": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["priority"], 3);

        let (status, listed) = call(&app, "GET", "/cluster/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
        assert_eq!(listed[0]["id"], id.as_str());

        let (status, refreshed) = call(&app, "POST", "/cluster/refresh", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refreshed[0]["status"], "online");

        let (_, stats) = call(&app, "GET", "/cluster/stats", None).await;
        assert_eq!(stats["online_nodes"], 1);
        assert_eq!(stats["max_kernels"], 3);

        let (status, removed) = call(&app, "DELETE", &format!("/cluster/nodes/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(removed["status"], "removed");

        let (status, _) = call(&app, "GET", &format!("/cluster/nodes/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_count_requests() {
        let app = app().await;
        call(&app, "GET", "/healthz", None).await;
        call(&app, "GET", "/cluster/nodes/missing", None).await;

        let resp = app
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("gpuhive_responses_4xx 1\n"), "{text}");
        assert!(text.contains("gpuhive_responses_2xx 1\n"), "{text}");
    }
}
