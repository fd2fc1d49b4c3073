use crate::config::CallbackMode;
use crate::errors::{QueueError, Result};
use crate::history::{HistoryView, JobEvent, JobFilter};
use crate::queue::{PrintJob, QueueManager, QueueStats, RetrySettings, RetrySettingsPatch};
use crate::sentry_init;
use crate::status::JobStatus;
use crate::telemetry::TelemetryCollector;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Json, Path, Query, State,
    },
    http::{StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// HTTP API server state
#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<QueueManager>,
    pub history: HistoryView,
    pub telemetry: Arc<TelemetryCollector>,
    pub media_types: Arc<Vec<String>>,
    pub callback_mode: CallbackMode,
    pub cors_origins: Arc<Vec<String>>,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(queue: Arc<QueueManager>, telemetry: Arc<TelemetryCollector>) -> Self {
        Self {
            history: HistoryView::new(queue.clone()),
            queue,
            telemetry,
            media_types: Arc::new(vec!["application/vnd.star.starprnt".to_string()]),
            callback_mode: CallbackMode::Strict,
            cors_origins: Arc::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }
}

/// `GET /print-jobs` query. The printer identifies itself by `device_id`.
#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    pub device_id: Option<String>,
}

/// Printer poll envelope. Only `jobReady` is present when there is no work.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub job_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,
}

impl PollResponse {
    pub fn no_job() -> Self {
        Self {
            job_ready: false,
            media_types: None,
            job_token: None,
            request: None,
        }
    }

    fn ready(job: PrintJob, media_types: &[String]) -> Self {
        Self {
            job_ready: true,
            media_types: Some(media_types.to_vec()),
            job_token: Some(job.id),
            request: Some(job.payload),
        }
    }
}

/// `POST /print-jobs` body
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SubmitRequest {
    pub device_id: Option<String>,
    pub job_data: Option<serde_json::Value>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub job_id: String,
}

/// `PUT /print-jobs` body, sent by the printer after it has printed
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CallbackRequest {
    #[serde(rename = "jobToken")]
    pub job_token: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            QueueError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            QueueError::MissingDeviceId => (StatusCode::BAD_REQUEST, "missing_device_id"),
            QueueError::InvalidStatus(_) => (StatusCode::BAD_REQUEST, "invalid_status"),
            QueueError::JobNotFound(_) => (StatusCode::NOT_FOUND, "job_not_found"),
            QueueError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            e if e.is_storage_failure() => (StatusCode::INTERNAL_SERVER_ERROR, "storage_failure"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = if status.is_server_error() {
            error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error: code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<JsonRejection> for QueueError {
    fn from(rejection: JsonRejection) -> Self {
        QueueError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for QueueError {
    fn from(rejection: QueryRejection) -> Self {
        QueueError::InvalidRequest(rejection.body_text())
    }
}

/// GET /print-jobs - Printer poll: claim the oldest pending job for the device
async fn handle_poll(
    State(state): State<ApiState>,
    query: std::result::Result<Query<PollQuery>, QueryRejection>,
) -> Result<Json<PollResponse>> {
    let Query(query) = query?;
    let device_id = query
        .device_id
        .filter(|d| !d.trim().is_empty())
        .ok_or(QueueError::MissingDeviceId)?;

    match state.queue.claim_next(&device_id).await? {
        Some(job) => {
            info!("Print job {} handed to device {}", job.id, job.device_id);
            Ok(Json(PollResponse::ready(job, &state.media_types)))
        }
        None => Ok(Json(PollResponse::no_job())),
    }
}

/// POST /print-jobs - Submit print job
async fn handle_submit(
    State(state): State<ApiState>,
    request: std::result::Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>> {
    let Json(request) = request?;
    let device_id = request
        .device_id
        .ok_or_else(|| QueueError::InvalidRequest("device_id is required".to_string()))?;
    let job_data = request
        .job_data
        .ok_or_else(|| QueueError::InvalidRequest("job_data is required".to_string()))?;

    let job = state.queue.submit(&device_id, job_data, request.max_retries).await?;

    info!("Print job enqueued: {} (device: {})", job.id, job.device_id);

    Ok(Json(SubmitResponse {
        success: true,
        job_id: job.id,
    }))
}

/// PUT /print-jobs - Printer reports the outcome of a claimed job
async fn handle_callback(
    State(state): State<ApiState>,
    request: std::result::Result<Json<CallbackRequest>, JsonRejection>,
) -> Result<Json<CallbackResponse>> {
    let Json(request) = request?;
    let job_token = request
        .job_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| QueueError::InvalidRequest("jobToken is required".to_string()))?;

    let reported: JobStatus = request.status.as_deref().unwrap_or_default().parse()?;
    if !reported.is_reportable() {
        return Err(QueueError::InvalidStatus(reported.to_string()));
    }

    let outcome = match reported {
        JobStatus::Completed => state.queue.mark_completed(&job_token).await,
        _ => state.queue.mark_failed(&job_token, request.error.as_deref()).await,
    };

    match outcome {
        Ok(job) => {
            if job.status == JobStatus::Failed {
                sentry_init::capture_print_job_failure(
                    &job.id,
                    &job.device_id,
                    job.error_message.as_deref().unwrap_or_default(),
                    job.retry_count,
                );
            }
            Ok(Json(CallbackResponse { success: true }))
        }
        // Printer resent a callback we already applied
        Err(QueueError::InvalidState { current, .. }) if current == reported => {
            debug!("Duplicate {} callback for job {}", reported, job_token);
            Ok(Json(CallbackResponse { success: true }))
        }
        Err(QueueError::JobNotFound(id)) if state.callback_mode == CallbackMode::Lenient => {
            warn!("Status callback for unknown job {} ignored (lenient mode)", id);
            Ok(Json(CallbackResponse { success: true }))
        }
        Err(e) => Err(e),
    }
}

/// GET /print-jobs/history - Job listing for the operator view
async fn handle_history(
    State(state): State<ApiState>,
    filter: std::result::Result<Query<JobFilter>, QueryRejection>,
) -> Result<Json<Vec<PrintJob>>> {
    let Query(filter) = filter?;
    Ok(Json(state.history.list(&filter).await?))
}

/// GET /print-jobs/history/:id
async fn handle_get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<PrintJob>> {
    Ok(Json(state.history.get(&job_id).await?))
}

/// POST /print-jobs/history/:id/retry - Operator override, ignores the retry ceiling
async fn handle_manual_retry(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<PrintJob>> {
    Ok(Json(state.history.retry(&job_id).await?))
}

/// GET /print-jobs/events - Live transition feed (Server-Sent Events)
async fn handle_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    Sse::new(job_event_stream(state.history.subscribe())).keep_alive(KeepAlive::default())
}

fn job_event_stream(
    receiver: broadcast::Receiver<JobEvent>,
) -> impl Stream<Item = std::result::Result<Event, axum::Error>> {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let sse = Event::default().event("job").json_data(&event);
                    return Some((sse, receiver));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("SSE subscriber lagged, {} job events skipped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// GET /print-jobs/settings
async fn handle_get_settings(State(state): State<ApiState>) -> Result<Json<RetrySettings>> {
    Ok(Json(state.queue.retry_settings().await?))
}

/// PUT /print-jobs/settings - Fields left out of the body keep their stored value
async fn handle_put_settings(
    State(state): State<ApiState>,
    patch: std::result::Result<Json<RetrySettingsPatch>, JsonRejection>,
) -> Result<Json<RetrySettings>> {
    let Json(patch) = patch?;
    Ok(Json(state.queue.patch_retry_settings(patch).await?))
}

/// GET /api/health - Health check endpoint
async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /api/queue/stats - Queue statistics
async fn handle_queue_stats(State(state): State<ApiState>) -> Result<Json<QueueStats>> {
    let stats = state.history.stats().await?;
    state.telemetry.record_queue_stats(stats).await;
    Ok(Json(stats))
}

/// GET /api/metrics - Telemetry metrics (Prometheus format)
async fn handle_metrics(State(state): State<ApiState>) -> String {
    state.telemetry.export_prometheus().await
}

/// GET /api/metrics/json - Telemetry metrics (JSON format)
async fn handle_metrics_json(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(state.telemetry.get_metrics_json().await)
}

/// Local operator consoles: http(s) on a loopback host, any port.
fn is_loopback_origin(origin: &str) -> bool {
    let Ok(uri) = origin.parse::<Uri>() else {
        return false;
    };
    matches!(uri.scheme_str(), Some("http") | Some("https"))
        && matches!(uri.host(), Some("localhost") | Some("127.0.0.1") | Some("[::1]"))
}

fn cors_layer(extra_origins: Arc<Vec<String>>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let Ok(origin) = origin.to_str() else {
                return false;
            };
            is_loopback_origin(origin) || extra_origins.iter().any(|allowed| allowed == origin)
        }))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

/// Create HTTP API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/print-jobs",
            get(handle_poll).post(handle_submit).put(handle_callback),
        )
        .route("/print-jobs/history", get(handle_history))
        .route("/print-jobs/history/:id", get(handle_get_job))
        .route("/print-jobs/history/:id/retry", post(handle_manual_retry))
        .route("/print-jobs/events", get(handle_events))
        .route(
            "/print-jobs/settings",
            get(handle_get_settings).put(handle_put_settings),
        )
        .route("/api/health", get(handle_health))
        .route("/api/queue/stats", get(handle_queue_stats))
        .route("/api/metrics", get(handle_metrics))
        .route("/api/metrics/json", get(handle_metrics_json))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(state.cors_origins.clone())),
        )
        .with_state(state)
}

/// Start HTTP API server; returns once `shutdown` resolves.
pub async fn start_api_server<F>(addr: &str, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("HTTP API server error: {}", e);
            e
        })
}
