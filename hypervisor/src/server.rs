//! HTTP surface of the station
//!
//! Client routes under `/v1`, operator routes under `/admin`, and `/health`.
//! Handlers only translate between JSON and [`HypervisorHandle`] calls.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use shared::{
    AdminResponse, Admission, BundleDescriptor, HealthReport, InferenceRequest, PoolStats, RequestId,
    RequestOutcome, RequestStatus, Settings, UpdatePhase, UpdateStatus, VersionDescriptor,
};

use crate::error::{HypervisorError, HypervisorResult};
use crate::hypervisor::{HypervisorHandle, InferenceReply};

/// Error answer with an [`AdminResponse`] body
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

impl From<HypervisorError> for ApiError {
    fn from(error: HypervisorError) -> Self {
        let status = match &error {
            HypervisorError::OperationInProgress { .. } => StatusCode::CONFLICT,
            HypervisorError::Configuration { .. }
            | HypervisorError::Shared(_)
            | HypervisorError::InvalidUpdate { .. } => StatusCode::BAD_REQUEST,
            HypervisorError::ControlLoopClosed | HypervisorError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            HypervisorError::LaunchFailed { .. }
            | HypervisorError::Backend { .. }
            | HypervisorError::TerminationFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(AdminResponse::error(self.1))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct InferOptions {
    pub timeout_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ResizeBody {
    pub workers: u32,
}

#[derive(Debug, Deserialize)]
pub struct ModelBody {
    pub model: String,
}

pub fn router(handle: HypervisorHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        // Client contract
        .route("/v1/stats", get(stats))
        .route("/v1/requests", post(submit))
        .route("/v1/requests/:id", get(poll))
        .route("/v1/:function", post(infer))
        // Administrative contract
        .route("/admin/start", post(start))
        .route("/admin/stop", post(stop))
        .route("/admin/restart", post(restart))
        .route("/admin/resize", post(resize))
        .route("/admin/model", post(set_model))
        .route("/admin/update", get(update_status).post(update))
        .route("/admin/settings", get(settings).put(put_settings))
        .route("/admin/version", get(version))
        .route("/admin/shutdown", post(shutdown))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(handle)
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, handle: HypervisorHandle, shutdown: F) -> HypervisorResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health(State(handle): State<HypervisorHandle>) -> ApiResult<Json<HealthReport>> {
    Ok(Json(handle.health().await?))
}

async fn stats(State(handle): State<HypervisorHandle>) -> ApiResult<Json<PoolStats>> {
    Ok(Json(handle.stats().await?))
}

async fn submit(
    State(handle): State<HypervisorHandle>,
    Json(request): Json<InferenceRequest>,
) -> ApiResult<(StatusCode, Json<Admission>)> {
    let admission = handle.submit(request).await?;
    let status = match admission {
        Admission::Accepted { .. } => StatusCode::ACCEPTED,
        Admission::Saturated => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((status, Json(admission)))
}

async fn poll(State(handle): State<HypervisorHandle>, Path(id): Path<String>) -> ApiResult<Json<RequestStatus>> {
    let request_id: RequestId = id.parse().map_err(HypervisorError::from)?;
    handle
        .poll(request_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("unknown request {request_id}")))
}

async fn infer(
    State(handle): State<HypervisorHandle>,
    Path(function): Path<String>,
    Query(options): Query<InferOptions>,
    Json(payload): Json<Value>,
) -> ApiResult<Response> {
    let request = InferenceRequest {
        function,
        payload,
        timeout_seconds: options.timeout_seconds,
    };

    let response = match handle.infer(request).await? {
        InferenceReply::Saturated => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(Admission::Saturated)).into_response()
        }
        InferenceReply::Finished(RequestOutcome::Completed { result }) => (StatusCode::OK, Json(result)).into_response(),
        InferenceReply::Finished(outcome @ RequestOutcome::TimedOut) => {
            (StatusCode::GATEWAY_TIMEOUT, Json(outcome)).into_response()
        }
        InferenceReply::Finished(outcome @ RequestOutcome::Rejected { .. }) => {
            (StatusCode::BAD_GATEWAY, Json(outcome)).into_response()
        }
    };
    Ok(response)
}

async fn start(State(handle): State<HypervisorHandle>) -> ApiResult<Json<AdminResponse>> {
    Ok(Json(handle.start().await?))
}

async fn stop(State(handle): State<HypervisorHandle>) -> ApiResult<Json<AdminResponse>> {
    Ok(Json(handle.stop().await?))
}

async fn restart(State(handle): State<HypervisorHandle>) -> ApiResult<Json<AdminResponse>> {
    Ok(Json(handle.restart().await?))
}

async fn resize(
    State(handle): State<HypervisorHandle>,
    Json(body): Json<ResizeBody>,
) -> ApiResult<Json<AdminResponse>> {
    Ok(Json(handle.resize(body.workers).await?))
}

async fn set_model(
    State(handle): State<HypervisorHandle>,
    Json(body): Json<ModelBody>,
) -> ApiResult<Json<AdminResponse>> {
    Ok(Json(handle.set_model(body.model).await?))
}

async fn update(
    State(handle): State<HypervisorHandle>,
    Json(descriptor): Json<BundleDescriptor>,
) -> ApiResult<(StatusCode, Json<UpdateStatus>)> {
    let status = handle.update(descriptor).await?;
    let code = match status.phase {
        UpdatePhase::Failed => StatusCode::BAD_REQUEST,
        _ => StatusCode::ACCEPTED,
    };
    Ok((code, Json(status)))
}

async fn update_status(State(handle): State<HypervisorHandle>) -> ApiResult<Json<UpdateStatus>> {
    Ok(Json(handle.update_status().await?))
}

async fn settings(State(handle): State<HypervisorHandle>) -> ApiResult<Json<Settings>> {
    Ok(Json(handle.settings().await?))
}

async fn put_settings(
    State(handle): State<HypervisorHandle>,
    Json(settings): Json<Settings>,
) -> ApiResult<Json<Value>> {
    let saved = handle.put_settings(settings).await?;
    Ok(Json(json!({
        "status": "ok",
        "settings": saved,
    })))
}

async fn version(State(handle): State<HypervisorHandle>) -> ApiResult<Json<VersionDescriptor>> {
    Ok(Json(handle.version().await?))
}

async fn shutdown(State(handle): State<HypervisorHandle>) -> ApiResult<Json<AdminResponse>> {
    handle.shutdown().await?;
    Ok(Json(AdminResponse::ok("shutting down")))
}
