//! HTTP management API
//!
//! Every route except `/health` requires the shared secret in the `key`
//! header. Responses use one envelope: `{"success", "msg", "data"}`.

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Json, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::NodeError;
use crate::monitor::CycleRecord;
use crate::node::Node;
use crate::openvpn::TunnelSettings;
use crate::users::{CreateOutcome, DeleteOutcome};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "key";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    node: Arc<Node>,
    api_key: Arc<str>,
}

impl AppState {
    pub fn new(node: Arc<Node>, api_key: &str) -> Self {
        Self {
            node,
            api_key: Arc::from(api_key),
        }
    }
}

/// Response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub msg: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn new(success: bool, msg: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success,
            msg: msg.into(),
            data: Some(data),
        })
    }
}

fn failure(msg: impl Into<String>) -> Json<ApiResponse<()>> {
    Json(ApiResponse {
        success: false,
        msg: msg.into(),
        data: None,
    })
}

/// Wrapper for API errors to implement IntoResponse
pub struct ApiError(NodeError);

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NodeError::Validation(_) | NodeError::ParseError(_) => StatusCode::BAD_REQUEST,
            NodeError::NotFound(_) => StatusCode::NOT_FOUND,
            NodeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            NodeError::EnvironmentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::Inconsistent(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, failure(self.0.to_string())).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(NodeError::Validation(rejection.body_text()))
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// JSON body extractor whose rejections use the response envelope
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if provided != Some(state.api_key.as_ref()) {
        warn!("Rejected request to {}: invalid API key", request.uri().path());
        return (StatusCode::UNAUTHORIZED, failure("Invalid API key")).into_response();
    }

    next.run(request).await
}

/// Build the router with all routes and middleware
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/openvpn/status", get(service_status))
        .route("/api/openvpn/health", get(health_report))
        .route("/api/openvpn/fix", post(auto_fix))
        .route("/api/openvpn/restart", post(restart))
        .route("/api/openvpn/errors", get(config_errors))
        .route("/api/openvpn/logs", get(service_logs))
        .route("/api/openvpn/monitor", get(monitor_state))
        .route("/api/settings", post(change_settings))
        .route("/sync/create-user", post(create_user))
        .route("/sync/delete-user", post(delete_user))
        .route("/sync/download/:name", get(download_profile))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ovnoded",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ============================================================================
// Service endpoints
// ============================================================================

async fn service_status(State(state): State<AppState>) -> ApiResult<crate::openvpn::ServiceStatus> {
    let status = state.node.probe().check_service_status().await;
    Ok(ApiResponse::new(true, "Service status", status))
}

async fn health_report(State(state): State<AppState>) -> ApiResult<crate::monitor::HealthReport> {
    let report = state.node.monitor().health_check().await;
    let msg = if report.healthy { "OpenVPN is healthy" } else { "OpenVPN is unhealthy" };
    Ok(ApiResponse::new(true, msg, report))
}

async fn auto_fix(State(state): State<AppState>) -> ApiResult<crate::monitor::AutoFixResult> {
    info!("Auto-fix requested over the API");
    let result = state.node.monitor().auto_fix_and_restart().await;
    let msg = if result.success { "Service fixed and running" } else { "Auto-fix did not restore the service" };
    Ok(ApiResponse::new(result.success, msg, result))
}

async fn restart(State(state): State<AppState>) -> ApiResult<bool> {
    let restarted = state.node.probe().restart_service().await;
    let msg = if restarted { "Service restarted" } else { "Service restart failed" };
    Ok(ApiResponse::new(restarted, msg, restarted))
}

async fn config_errors(State(state): State<AppState>) -> ApiResult<Vec<crate::openvpn::ConfigDefect>> {
    let defects = state.node.monitor().config_defects().await;
    let msg = format!("{} configuration error(s) detected", defects.len());
    Ok(ApiResponse::new(true, msg, defects))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn service_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> ApiResult<String> {
    let lines = query.lines.unwrap_or(state.node.config().monitor.log_lines);
    let logs = state.node.probe().get_service_logs(lines).await?;
    Ok(ApiResponse::new(true, format!("Last {} journal lines", lines), logs))
}

#[derive(Debug, Serialize)]
struct MonitorState {
    running: bool,
    last_cycle: Option<CycleRecord>,
}

async fn monitor_state(State(state): State<AppState>) -> ApiResult<MonitorState> {
    let data = MonitorState {
        running: state.node.background().is_running().await,
        last_cycle: state.node.monitor().last_cycle().await,
    };
    Ok(ApiResponse::new(true, "Background monitor state", data))
}

async fn change_settings(State(state): State<AppState>, ApiJson(change): ApiJson<TunnelSettings>) -> ApiResult<TunnelSettings> {
    info!("Settings change requested: {:?}", change);
    state.node.change_config(&change).await?;
    Ok(ApiResponse::new(true, "Settings applied", change))
}

// ============================================================================
// User endpoints
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct UserRequest {
    name: String,
}

async fn create_user(State(state): State<AppState>, ApiJson(user): ApiJson<UserRequest>) -> ApiResult<UserRequest> {
    let msg = match state.node.users().create_user(&user.name).await? {
        CreateOutcome::Created => "User created successfully",
        CreateOutcome::AlreadyExists => "User already exists",
    };
    Ok(ApiResponse::new(true, msg, user))
}

async fn delete_user(State(state): State<AppState>, ApiJson(user): ApiJson<UserRequest>) -> ApiResult<UserRequest> {
    match state.node.users().delete_user(&user.name).await? {
        DeleteOutcome::Deleted => Ok(ApiResponse::new(true, "User deleted successfully", user)),
        DeleteOutcome::NotFound => Err(NodeError::NotFound(format!("user '{}'", user.name)).into()),
    }
}

async fn download_profile(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response, ApiError> {
    let path = state.node.users().download_profile(&name).await?;
    let body = tokio::fs::read(&path).await.map_err(NodeError::from)?;
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("{}.ovpn", name));

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-openvpn-profile".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", file_name)),
        ],
        body,
    )
        .into_response())
}
