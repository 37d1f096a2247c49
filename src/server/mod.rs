//! HTTP adapter: health, readiness, metrics and job submission.
//!
//! | Route             | Response |
//! |-------------------|----------|
//! | `GET /healthz`    | `200 ok` |
//! | `GET /readiness`  | `200 ok`, or `503 not ready` while a job holds the lock |
//! | `GET /metrics`    | Prometheus text exposition |
//! | `POST /start`     | submits a job (only when listening for jobs) |
//! | `OPTIONS /start`  | CORS pre-flight |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::coordinator::JobCoordinator;
use crate::dispatch::{self, START_GRACE};
use crate::job::Job;
use crate::metrics::metrics_handler;

const ALLOW_METHODS: &str = "POST";
const ALLOW_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Accept";

/// Shared state of the HTTP adapter.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<JobCoordinator>,
    pub start_grace: Duration,
}

impl AppState {
    pub fn new(coordinator: Arc<JobCoordinator>) -> Self {
        Self {
            coordinator,
            start_grace: START_GRACE,
        }
    }

    /// Sets how long `POST /start` waits for an early failure.
    pub fn with_start_grace(mut self, grace: Duration) -> Self {
        self.start_grace = grace;
        self
    }
}

#[derive(Serialize)]
struct StartResponse {
    status: &'static str,
}

/// Builds the router; `/start` is only mounted when `listen` is set.
pub fn router(state: AppState, listen: bool) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readiness", get(readiness))
        .route("/metrics", get(metrics_handler));

    if listen {
        app = app.route("/start", post(start).options(preflight));
    }

    app.with_state(state)
}

/// Serves `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Response {
    if state.coordinator.lock_state().is_ready() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn start(State(state): State<AppState>, body: Bytes) -> Response {
    let response = match serde_json::from_slice::<Job>(&body) {
        Err(e) => (
            StatusCode::BAD_REQUEST,
            format!("could not parse JSON: {}", e),
        )
            .into_response(),
        Ok(job) => {
            info!(evidence = %job.evidence_path, "Job submitted");
            match dispatch::submit(Arc::clone(&state.coordinator), job, state.start_grace).await {
                Ok(_) => Json(StartResponse { status: "started" }).into_response(),
                Err(e) => (StatusCode::BAD_REQUEST, format!("error : {}", e)).into_response(),
            }
        }
    };
    allow_any_origin(response)
}

async fn preflight() -> Response {
    let mut response = allow_any_origin(StatusCode::OK.into_response());
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    response
}

fn allow_any_origin(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}
