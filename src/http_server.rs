//! HTTP gateway using Axum.
//!
//! Every response is wrapped in the envelope the orchestrator expects:
//! `{success, engine, timestamp_ms, data}` or
//! `{success: false, engine, timestamp_ms, error: {code, message, details}}`.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{CancelError, SubmitError};
use crate::job::now_ms;
use crate::metrics;
use crate::state::AppState;

pub const ENGINE_NAME: &str = "cpp_engine";
pub const TOKEN_HEADER: &str = "x-orchestrator-token";
const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("server misconfigured: missing CODEIA_ORCHESTRATOR_TOKEN")]
    MissingSecret,

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("task not found")]
    TaskNotFound(String),

    #[error("task already {status}")]
    AlreadyFinished { task_id: String, status: String },

    #[error("{message}")]
    Internal { message: String, details: Value },
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal {
            message: message.into(),
            details: json!({}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, details) = match &self {
            ApiError::MissingSecret => (StatusCode::SERVICE_UNAVAILABLE, json!({})),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, json!({})),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, json!({})),
            ApiError::TaskNotFound(id) => (StatusCode::NOT_FOUND, json!({ "task_id": id })),
            ApiError::AlreadyFinished { task_id, status } => (
                StatusCode::CONFLICT,
                json!({ "task_id": task_id, "status": status }),
            ),
            ApiError::Internal { details, .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, details.clone())
            }
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }
        let body = json!({
            "success": false,
            "engine": ENGINE_NAME,
            "timestamp_ms": now_ms(),
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "details": details,
            },
        });
        (status, Json(body)).into_response()
    }
}

impl From<CancelError> for ApiError {
    fn from(e: CancelError) -> Self {
        match e {
            CancelError::NotFound(id) => ApiError::TaskNotFound(id),
            CancelError::AlreadyFinished { id, status } => ApiError::AlreadyFinished {
                task_id: id,
                status: status.to_string(),
            },
        }
    }
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "success": true,
        "engine": ENGINE_NAME,
        "timestamp_ms": now_ms(),
        "data": data,
    }))
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Build the router. `/health` is open; everything else requires the
/// orchestrator token.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/process", post(process))
        .route("/status/:id", get(status))
        .route("/results/:id", get(results))
        .route("/tasks", get(list_tasks))
        .route("/metrics", get(metrics_rollup))
        .route("/metrics/:id", get(task_metrics))
        .route("/cancel/:id", post(cancel))
        .route("/validate", post(validate))
        .route("/validate/batch", post(validate_batch))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = state.config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr = %listener.local_addr()?,
        engine_bin = ?state.config.engine_bin,
        "Starting HTTP server"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    authorize(state.config.orchestrator_token.as_deref(), request.headers())?;
    Ok(next.run(request).await)
}

/// Check the caller's token. `X-Orchestrator-Token` wins over
/// `Authorization: Bearer`.
pub fn authorize(expected: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = expected.filter(|t| !t.is_empty()).ok_or(ApiError::MissingSecret)?;
    let provided = match headers.get(TOKEN_HEADER) {
        Some(value) => value.to_str().ok(),
        None => headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ")),
    };
    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => {
            warn!("Rejected request with missing or invalid token");
            Err(ApiError::Unauthorized)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(json!({
        "service": ENGINE_NAME,
        "ready": true,
        "port": state.config.port,
        "launch_mode": state.config.launch_mode,
        "engine_bin": state.config.engine_bin,
    }))
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    command: Option<Vec<String>>,
    filter: Option<String>,
    input: Option<String>,
    output: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    timeout: Option<i64>,
}

impl ProcessRequest {
    /// Engine arguments for the `{filter, input, output, args}` form.
    fn engine_args(self) -> Vec<String> {
        let mut argv = Vec::new();
        for (flag, value) in [
            ("--filter", self.filter),
            ("--input", self.input),
            ("--output", self.output),
        ] {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                argv.push(flag.to_string());
                argv.push(value);
            }
        }
        argv.extend(self.args);
        argv
    }
}

async fn process(
    State(state): State<AppState>,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut request) =
        payload.map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e.body_text())))?;
    let timeout = request.timeout;

    let (argv, engine_form) = match request.command.take() {
        Some(command) => (command, false),
        None => {
            let args = request.engine_args();
            if args.is_empty() {
                return Err(ApiError::BadRequest(SubmitError::EmptyCommand.to_string()));
            }
            let mut argv = vec![state.config.engine_bin.to_string_lossy().into_owned()];
            argv.extend(args);
            (argv, true)
        }
    };

    // Binary lookup and the first job-file write touch the filesystem.
    let dispatcher = Arc::clone(&state.dispatcher);
    let submission = tokio::task::spawn_blocking(move || dispatcher.submit(argv, timeout))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(|e| match e {
            SubmitError::BinaryNotFound(_) | SubmitError::NotExecutable(_) if engine_form => {
                ApiError::Internal {
                    message: "Engine binary not found".to_string(),
                    details: json!({ "engine_bin": state.config.engine_bin }),
                }
            }
            SubmitError::Registry(e) => ApiError::internal(e.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        })?;

    let id = &submission.task_id;
    let body = envelope(json!({
        "task_id": id,
        "status": "accepted",
        "status_url": format!("/status/{id}"),
        "results_url": format!("/results/{id}"),
        "metrics_url": format!("/metrics/{id}"),
        "timeout_seconds": submission.timeout_seconds,
    }));
    Ok((StatusCode::ACCEPTED, body).into_response())
}

async fn status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let job = state.registry.get(&id).ok_or(ApiError::TaskNotFound(id))?;
    Ok(envelope(job.snapshot()))
}

async fn results(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let job = state.registry.get(&id).ok_or(ApiError::TaskNotFound(id))?;
    Ok(envelope(json!({
        "task_id": job.task_id,
        "status": job.status,
        "exit_code": job.exit_code,
        "stdout": job.stdout,
        "stderr": job.stderr,
    })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<String>,
}

/// Unparseable limits fall back to the default; anything below 1 becomes 1.
fn list_limit(raw: Option<&str>) -> usize {
    match raw.map(|s| s.trim().parse::<i64>()) {
        Some(Ok(n)) => n.max(1) as usize,
        _ => DEFAULT_LIST_LIMIT,
    }
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult {
    let limit = list_limit(query.limit.as_deref());
    let tasks: Vec<_> = state
        .registry
        .list(limit)
        .iter()
        .map(|job| job.summary())
        .collect();
    Ok(envelope(json!({
        "tasks": tasks,
        "total": state.registry.len(),
    })))
}

async fn metrics_rollup(State(state): State<AppState>) -> ApiResult {
    Ok(envelope(metrics::aggregate(&state.registry)))
}

async fn task_metrics(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let job = state.registry.get(&id).ok_or(ApiError::TaskNotFound(id))?;
    Ok(envelope(job.metrics))
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let status = state.dispatcher.cancel(&id)?;
    Ok(envelope(json!({
        "task_id": id,
        "cancelled": true,
        "status": status,
    })))
}

async fn validate(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let validator = state.validator.clone();
    let result = tokio::task::spawn_blocking(move || validator.validate(&request))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(envelope(result))
}

async fn validate_batch(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let validator = state.validator.clone();
    let result = tokio::task::spawn_blocking(move || validator.validate_batch(&request))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(envelope(result))
}
