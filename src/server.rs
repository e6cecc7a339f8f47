//! HTTP surface.
//!
//! ```text
//! GET  /health    → 200 {"ok": true}
//! POST /pp/table  → multipart {file, roi?} → 200 TableResult | 4xx/5xx {"error": ...}
//! ```
//!
//! The handler decodes the upload, waits for an admission slot, then hands
//! the prepared input either to the [`Supervisor`] (isolation on) or to
//! [`run_inline`]. Every outcome other than success maps to a status code
//! and a single `error` string; nothing a worker does can take the service
//! down.

use crate::config::{ServiceConfig, SupervisorConfig};
use crate::engine::EngineHolder;
use crate::error::ServiceError;
use crate::outcome::TaskOutcome;
use crate::pipeline::inline::run_inline;
use crate::pipeline::prepare::{prepare, TaskInput};
use crate::pipeline::supervisor::{Supervisor, WorkerLauncher};
use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, error, info, warn};

/// Shared, cheaply cloneable handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    supervisor_config: SupervisorConfig,
    supervisor: Arc<Supervisor>,
    holder: Arc<EngineHolder>,
    gate: Option<Arc<Semaphore>>,
    max_upload_bytes: usize,
}

impl AppState {
    /// Build the state for `config`, spawning workers with `launcher`.
    pub fn new(config: &ServiceConfig, launcher: WorkerLauncher) -> Self {
        let gate = match config.max_concurrent_workers {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            supervisor_config: config.supervisor.clone(),
            supervisor: Arc::new(Supervisor::new(launcher, config.engine.clone())),
            holder: Arc::new(EngineHolder::new(config.engine.clone())),
            gate,
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    /// Replace the engine used when isolation is off.
    pub fn with_engine_holder(mut self, holder: Arc<EngineHolder>) -> Self {
        self.holder = holder;
        self
    }

    /// Prepare `file` and run it through the configured executor.
    pub async fn extract(
        &self,
        file: Bytes,
        roi: Option<String>,
    ) -> Result<TaskOutcome, ServiceError> {
        let max_dimension = self.supervisor_config.max_dimension;
        let input = tokio::task::spawn_blocking(move || {
            prepare(&file, roi.as_deref(), max_dimension)
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("Preprocessing task failed: {e}")))??;

        let _permit = match &self.gate {
            Some(gate) => Some(
                gate.acquire()
                    .await
                    .map_err(|e| ServiceError::Internal(format!("Admission gate closed: {e}")))?,
            ),
            None => None,
        };

        if self.supervisor_config.isolation {
            self.supervisor.run(input, &self.supervisor_config).await
        } else {
            run_inline(self.holder.clone(), input).await
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/pp/table", post(extract_table))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive().allow_private_network(true))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("access-control-allow-private-network"),
            HeaderValue::from_static("true"),
        ))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn extract_table(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let started = Instant::now();
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => return error_response(rejection.status(), rejection.body_text()),
    };
    let (file, roi) = match read_form(&mut multipart).await {
        Ok(form) => form,
        Err(response) => return response,
    };
    debug!("Received {} byte upload (roi: {})", file.len(), roi.is_some());

    match state.extract(file, roi).await {
        Ok(TaskOutcome::Success(result)) => {
            info!("Table extracted in {:?}", started.elapsed());
            (StatusCode::OK, Json(result)).into_response()
        }
        Ok(outcome) => {
            let status = if matches!(outcome, TaskOutcome::Timeout) {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            warn!("Request failed with {} after {:?}", outcome.kind(), started.elapsed());
            error_response(status, outcome.to_string())
        }
        Err(e) => {
            error!("Request failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn read_form(multipart: &mut Multipart) -> Result<(Bytes, Option<String>), Response> {
    let mut file = None;
    let mut roi = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => file = Some(field.bytes().await.map_err(multipart_error)?),
            "roi" => {
                let text = field.text().await.map_err(multipart_error)?;
                roi = Some(text).filter(|t| !t.trim().is_empty());
            }
            _ => {}
        }
    }
    let file = file
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Missing 'file' field"))?;
    Ok((file, roi))
}

fn multipart_error(e: MultipartError) -> Response {
    error_response(e.status(), e.body_text())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Pre-load the task body in the background.
///
/// The returned handle is never awaited by request handling; the result is
/// only logged.
pub fn spawn_warmup(state: &AppState) -> JoinHandle<()> {
    let state = state.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        if state.supervisor_config.isolation {
            let probe = TaskInput::blank(32, 32);
            match state.supervisor.run(probe, &state.supervisor_config).await {
                Ok(TaskOutcome::Success(_)) => {
                    info!("Warmup probe succeeded in {:?}", started.elapsed())
                }
                Ok(outcome) => warn!("Warmup probe ended with {}: {outcome}", outcome.kind()),
                Err(e) => warn!("Warmup probe failed: {e}"),
            }
        } else {
            let holder = state.holder.clone();
            match tokio::task::spawn_blocking(move || holder.get().map(|_| ())).await {
                Ok(Ok(())) => info!("Engine warmed up in {:?}", started.elapsed()),
                Ok(Err(e)) => warn!("Warmup failed: {e}"),
                Err(e) => warn!("Warmup task aborted: {e}"),
            }
        }
    })
}

/// Run the service until Ctrl-C or SIGTERM.
pub async fn serve(config: ServiceConfig) -> Result<(), ServiceError> {
    let state = AppState::new(&config, WorkerLauncher::current_exe()?);
    if config.warmup {
        spawn_warmup(&state);
    }

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| ServiceError::Internal(format!("Cannot bind {}: {e}", config.bind)))?;
    info!(
        "Listening on {} (isolation={}, deadline={:?})",
        config.bind, config.supervisor.isolation, config.supervisor.deadline
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServiceError::Internal(format!("Server error: {e}")))?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
