//! # Administrative REST API
//!
//! Host management and status endpoints served next to the WebSocket:
//!
//! | Method | Path                        | Purpose                               |
//! |--------|-----------------------------|---------------------------------------|
//! | GET    | `/health`                   | Liveness check                        |
//! | GET    | `/api/nodes`                | List registered hosts                 |
//! | POST   | `/api/nodes`                | Register a host                       |
//! | PATCH  | `/api/nodes/{id}`           | Rename a host                         |
//! | DELETE | `/api/nodes/{id}`           | Deregister a host                     |
//! | POST   | `/api/nodes/{id}/refresh`   | Request an out-of-band fetch          |
//! | GET    | `/api/status`               | Polling state of every host           |
//! | POST   | `/api/validate`             | Test connection details before saving |

use crate::nodes_logic::state::AppState;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use lib_common::core::{HostConfig, HostError, HostStatus, HostSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A failed request, rendered as `{"error": "..."}`.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        let status = match err {
            HostError::DuplicateHost(_) => StatusCode::CONFLICT,
            HostError::UnknownHost(_) => StatusCode::NOT_FOUND,
            HostError::InvalidHostId(_) | HostError::InvalidBaseUrl { .. } => StatusCode::BAD_REQUEST,
        };
        ApiError(status, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub base_url: String,
    pub auth_token_id: String,
    pub auth_token_secret: String,
}

#[derive(Debug, Serialize, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/nodes", get(list_nodes).post(create_node))
        .route("/api/nodes/{id}", patch(rename_node).delete(delete_node))
        .route("/api/nodes/{id}/refresh", post(refresh_node))
        .route("/api/status", get(status_handler))
        .route("/api/validate", post(validate_handler))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.uptime_seconds(),
        "connections": state.hub.dispatcher().client_count(),
    }))
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<HostSummary>> {
    Json(state.hub.scheduler().host_summaries())
}

async fn create_node(
    State(state): State<AppState>,
    Json(host): Json<HostConfig>,
) -> Result<(StatusCode, Json<HostSummary>), ApiError> {
    let summary = host.summary();
    state.hub.scheduler().register_host(host)?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn rename_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<HostSummary>, ApiError> {
    let scheduler = state.hub.scheduler();
    scheduler.rename_host(&id, &body.display_name)?;
    let host = scheduler.host(&id).ok_or_else(|| HostError::UnknownHost(id.clone()))?;
    Ok(Json(host.summary()))
}

async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let released = state.hub.scheduler().deregister_host(&id)?;
    Ok(Json(json!({ "removed": id, "releasedConnections": released.len() })))
}

async fn refresh_node(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let scheduler = state.hub.scheduler();
    if scheduler.host(&id).is_none() {
        return Err(HostError::UnknownHost(id).into());
    }
    if scheduler.trigger(&id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError(
            StatusCode::CONFLICT,
            format!("host '{}' has no subscribers and is not being polled", id),
        ))
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<Vec<HostStatus>> {
    Json(state.hub.scheduler().status())
}

/// Fetcher key used while validating. `#` is not allowed in host ids, so
/// a registered host never shares its client or counter history.
pub const VALIDATION_HOST_ID: &str = "#validate";

/// Performs one fetch with the supplied credentials without registering
/// anything.
async fn validate_handler(
    State(state): State<AppState>,
    Json(body): Json<ValidateRequest>,
) -> Result<(StatusCode, Json<ValidateResponse>), ApiError> {
    let candidate = HostConfig {
        host_id: VALIDATION_HOST_ID.to_string(),
        display_name: VALIDATION_HOST_ID.to_string(),
        base_url: body.base_url,
        auth_token_id: body.auth_token_id,
        auth_token_secret: body.auth_token_secret,
    };
    lib_common::core::hosts::validate_base_url(&candidate.base_url)?;

    let timeout = state.hub.scheduler().config().fetch_timeout;
    let fetcher = state.hub.fetcher();
    let outcome = tokio::time::timeout(timeout, fetcher.fetch(&candidate)).await;
    fetcher.forget(VALIDATION_HOST_ID);
    let response = match outcome {
        Ok(Ok(snapshot)) => (
            StatusCode::OK,
            ValidateResponse {
                ok: true,
                resource_count: Some(snapshot.records.len()),
                code: None,
                message: None,
            },
        ),
        Ok(Err(err)) => (
            StatusCode::BAD_GATEWAY,
            ValidateResponse {
                ok: false,
                resource_count: None,
                code: Some(err.code().as_str().to_string()),
                message: Some(err.to_string()),
            },
        ),
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            ValidateResponse {
                ok: false,
                resource_count: None,
                code: Some("TIMEOUT".to_string()),
                message: Some(format!("no response within {} ms", timeout.as_millis())),
            },
        ),
    };
    log::info!("Validation of {} finished: ok={}", candidate.base_url, response.1.ok);
    Ok((response.0, Json(response.1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::core::fetcher::ScriptedFetcher;
    use lib_common::core::{MetricsFetcher, NodeHub, SchedulerConfig};
    use std::sync::Arc;

    async fn spawn_app() -> (String, AppState, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let hub = NodeHub::new(SchedulerConfig::default(), Arc::clone(&fetcher) as Arc<dyn MetricsFetcher>).unwrap();
        let state = AppState::new(hub);
        let app = routes().with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state, fetcher)
    }

    fn host_body(id: &str) -> serde_json::Value {
        json!({
            "hostId": id,
            "displayName": "Rack One",
            "baseUrl": "https://10.0.0.1:8006",
            "authTokenId": "root@pam!dash",
            "authTokenSecret": "secret"
        })
    }

    #[tokio::test]
    async fn test_node_crud() {
        let (base, state, _fetcher) = spawn_app().await;
        let client = reqwest::Client::new();

        let created = client.post(format!("{}/api/nodes", base)).json(&host_body("pve-01")).send().await.unwrap();
        assert_eq!(created.status(), reqwest::StatusCode::CREATED);
        let dup = client.post(format!("{}/api/nodes", base)).json(&host_body("pve-01")).send().await.unwrap();
        assert_eq!(dup.status(), reqwest::StatusCode::CONFLICT);
        let bad = client.post(format!("{}/api/nodes", base)).json(&host_body("bad id")).send().await.unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

        let list: Vec<serde_json::Value> = client.get(format!("{}/api/nodes", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].get("authTokenSecret").is_none());

        let renamed = client
            .patch(format!("{}/api/nodes/pve-01", base))
            .json(&json!({"displayName": "Rack Two"}))
            .send()
            .await
            .unwrap();
        assert_eq!(renamed.status(), reqwest::StatusCode::OK);
        assert_eq!(state.hub.scheduler().display_name("pve-01").as_deref(), Some("Rack Two"));

        // Idle hosts cannot be refreshed.
        let refresh = client.post(format!("{}/api/nodes/pve-01/refresh", base)).send().await.unwrap();
        assert_eq!(refresh.status(), reqwest::StatusCode::CONFLICT);

        let status: Vec<serde_json::Value> = client.get(format!("{}/api/status", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(status[0]["state"], "IDLE");

        let deleted = client.delete(format!("{}/api/nodes/pve-01", base)).send().await.unwrap();
        assert_eq!(deleted.status(), reqwest::StatusCode::OK);
        let missing = client.delete(format!("{}/api/nodes/pve-01", base)).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validate_reports_fetch_outcome() {
        let (base, _state, _fetcher) = spawn_app().await;
        let client = reqwest::Client::new();

        let ok: ValidateResponse = client
            .post(format!("{}/api/validate", base))
            .json(&json!({"baseUrl": "https://10.0.0.9:8006", "authTokenId": "t", "authTokenSecret": "s"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(ok.ok);
        assert_eq!(ok.resource_count, Some(1));

        let bad = client
            .post(format!("{}/api/validate", base))
            .json(&json!({"baseUrl": "ftp://nope", "authTokenId": "t", "authTokenSecret": "s"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_validation_does_not_share_state_with_a_host_named_validate() {
        let (base, state, fetcher) = spawn_app().await;
        let client = reqwest::Client::new();
        let created = client.post(format!("{}/api/nodes", base)).json(&host_body("validate")).send().await.unwrap();
        assert_eq!(created.status(), reqwest::StatusCode::CREATED);

        let response = client
            .post(format!("{}/api/validate", base))
            .json(&json!({"baseUrl": "https://10.0.0.9:8006", "authTokenId": "t", "authTokenSecret": "s"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        assert_eq!(fetcher.calls_for("validate"), 0);
        assert_eq!(fetcher.calls_for(VALIDATION_HOST_ID), 1);
        assert_eq!(fetcher.forgotten(), vec![VALIDATION_HOST_ID.to_string()]);
        assert!(state.hub.scheduler().host("validate").is_some());
        assert!(lib_common::core::hosts::validate_host_id(VALIDATION_HOST_ID).is_err());
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _state, _fetcher) = spawn_app().await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base)).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }
}
