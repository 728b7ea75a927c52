use crate::errors::{AuthError, CacheError, Error, ValidationError};
use crate::metrics;
use crate::model::DeviceId;
use crate::service::TelemetryService;
use crate::validate::measurements_from_json;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{error, warn};

const API_KEY_HEADER: &str = "x-api-key";
const ADMIN_SCHEME: &str = "admin ";
const DEFAULT_RANGE_LIMIT: usize = 1_000;

#[derive(Clone)]
struct AppState {
    service: Arc<TelemetryService>,
    admin_token: Option<Arc<str>>,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    measurements: Map<String, Value>,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    start: String,
    end: String,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AggregateParams {
    measurement: String,
    function: String,
    window: i64,
    start: String,
    end: String,
}

#[derive(Debug, Deserialize)]
struct StatusesBody {
    device_ids: Vec<DeviceId>,
}

pub fn create_router(service: Arc<TelemetryService>, admin_token: Option<String>) -> Router {
    let state = AppState {
        service,
        admin_token: admin_token.map(Arc::from),
    };

    Router::new()
        .route(
            "/api/v1/devices/:id/telemetry",
            post(submit).get(get_range).delete(delete_range),
        )
        .route("/api/v1/devices/:id/telemetry/latest", get(get_latest))
        .route("/api/v1/devices/:id/telemetry/aggregate", get(get_aggregate))
        .route("/api/v1/devices/:id/heartbeat", post(heartbeat))
        .route("/api/v1/devices/:id/status", get(get_status))
        .route("/api/v1/devices/statuses", post(get_statuses))
        .route("/api/v1/admin/sync", post(bulk_sync))
        .route("/api/v1/admin/sync/devices/:id", post(force_sync))
        .route("/api/v1/admin/sync/enable", post(enable_sync))
        .route("/api/v1/admin/sync/disable", post(disable_sync))
        .route("/api/v1/admin/sync/stats", get(sync_stats))
        .route("/api/v1/admin/cache/stats", get(cache_stats))
        .route("/api/v1/admin/cache", delete(clear_all_caches))
        .route("/api/v1/admin/cache/devices/:id", delete(clear_device_cache))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

fn credential(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ValidationError::InvalidTimestamp(raw.to_string()))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(AppError::AdminDisabled);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(ADMIN_SCHEME));
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => {
            warn!("Rejected admin request with missing or wrong token");
            Err(AppError::Api(AuthError::Invalid.into()))
        }
    }
}

async fn submit(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Result<impl IntoResponse, AppError> {
    let timestamp = body.timestamp.as_deref().map(parse_timestamp).transpose()?;
    let measurements = measurements_from_json(&body.measurements);
    let receipt = state
        .service
        .submit(device_id, credential(&headers), &measurements, timestamp)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let at = state.service.heartbeat(device_id, credential(&headers)).await?;
    Ok(Json(json!({ "device_id": device_id, "last_seen": at })))
}

async fn get_range(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
    Query(params): Query<WindowQuery>,
) -> Result<impl IntoResponse, AppError> {
    let start = parse_timestamp(&params.start)?;
    let end = parse_timestamp(&params.end)?;
    let limit = params.limit.unwrap_or(DEFAULT_RANGE_LIMIT);
    let result = state
        .service
        .get_range(device_id, credential(&headers), start, end, limit)
        .await?;
    Ok(Json(result))
}

async fn delete_range(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
    Query(params): Query<WindowQuery>,
) -> Result<Json<Value>, AppError> {
    let start = parse_timestamp(&params.start)?;
    let end = parse_timestamp(&params.end)?;
    let deleted = state
        .service
        .delete_range(device_id, credential(&headers), start, end)
        .await?;
    Ok(Json(json!({ "device_id": device_id, "deleted": deleted })))
}

async fn get_latest(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let latest = state.service.get_latest(device_id, credential(&headers)).await?;
    Ok(Json(latest))
}

async fn get_aggregate(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
    Query(params): Query<AggregateParams>,
) -> Result<impl IntoResponse, AppError> {
    let start = parse_timestamp(&params.start)?;
    let end = parse_timestamp(&params.end)?;
    let result = state
        .service
        .get_aggregate(
            device_id,
            credential(&headers),
            &params.measurement,
            &params.function,
            params.window,
            start,
            end,
        )
        .await?;
    Ok(Json(result))
}

async fn get_status(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.service.get_status(device_id).await?))
}

async fn get_statuses(
    State(state): State<AppState>,
    Json(body): Json<StatusesBody>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.service.get_statuses(&body.device_ids).await?))
}

async fn bulk_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.service.bulk_sync().await))
}

async fn force_sync(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.service.force_sync(device_id).await?))
}

async fn enable_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    state.service.enable_sync();
    Ok(Json(json!({ "enabled": state.service.sync_enabled() })))
}

async fn disable_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    state.service.disable_sync();
    Ok(Json(json!({ "enabled": state.service.sync_enabled() })))
}

async fn sync_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.service.get_sync_stats().await))
}

async fn cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.service.get_cache_stats().await))
}

async fn clear_device_cache(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let removed = state.service.clear_device_cache(device_id).await?;
    Ok(Json(json!({ "device_id": device_id, "removed": removed })))
}

async fn clear_all_caches(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let removed = state.service.clear_all_device_caches().await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.service.health().await;
    let status = if health.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

#[derive(Debug)]
enum AppError {
    Api(Error),
    Cache(CacheError),
    AdminDisabled,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Api(Error::Auth(AuthError::Inactive(_))) => StatusCode::FORBIDDEN,
            AppError::Api(Error::Auth(_)) => StatusCode::UNAUTHORIZED,
            AppError::Api(Error::Validation(_)) => StatusCode::BAD_REQUEST,
            AppError::Api(Error::NotFound(_)) | AppError::Api(Error::Reconcile(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::Api(Error::Storage(_)) | AppError::Cache(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::AdminDisabled => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, retryable) = match &self {
            AppError::Api(e) => (e.to_string(), e.is_retryable()),
            AppError::Cache(e) => (e.to_string(), true),
            AppError::AdminDisabled => ("admin API disabled: no ADMIN_TOKEN configured".to_string(), false),
        };
        if status.is_server_error() {
            error!("API error: {}", message);
        }
        (status, Json(json!({ "error": message, "retryable": retryable }))).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Api(err)
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Api(err.into())
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Api(err.into())
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        AppError::Cache(err)
    }
}
