//! HTTP daemon.
//!
//! `POST /` checks the request body and answers with the report document; `GET /health`
//! reports the loaded scenarios and worker statistics. Checks run on blocking threads, at
//! most `workers` at a time.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{AcquireError, Semaphore};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{CheckError, Result};
use crate::pipeline::{Check, Input};

/// Listener and worker pool settings
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub request_timeout: Duration,
    pub max_request_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            request_timeout: Duration::from_secs(30),
            max_request_bytes: 16 * 1024 * 1024,
        }
    }
}

impl DaemonConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub name: Option<String>,
    pub scenarios: Vec<String>,
    pub workers: usize,
    pub available_workers: usize,
    pub completed: u64,
}

struct DaemonState<E: Engine> {
    check: Arc<Check<E>>,
    permits: Arc<Semaphore>,
    workers: usize,
    request_timeout: Duration,
}

impl<E: Engine> Clone for DaemonState<E> {
    fn clone(&self) -> Self {
        Self {
            check: Arc::clone(&self.check),
            permits: Arc::clone(&self.permits),
            workers: self.workers,
            request_timeout: self.request_timeout,
        }
    }
}

/// Build the daemon's routes around an initialized pipeline
pub fn router<E: Engine>(check: Arc<Check<E>>, config: &DaemonConfig) -> Router {
    let workers = config.workers.max(1);
    let state = DaemonState {
        check,
        permits: Arc::new(Semaphore::new(workers)),
        workers,
        request_timeout: config.request_timeout,
    };

    Router::new()
        .route("/", post(check_document::<E>))
        .route("/health", get(health::<E>))
        .layer(DefaultBodyLimit::max(config.max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn check_document<E: Engine>(State(state): State<DaemonState<E>>, body: Bytes) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!("check", request = %request_id);

    async move {
        if body.is_empty() {
            return (StatusCode::BAD_REQUEST, "Request body is empty\n").into_response();
        }

        let name = format!("request-{}", request_id);
        let input = Input::from_bytes(name.clone(), body.to_vec());
        let check = Arc::clone(&state.check);
        let permits = Arc::clone(&state.permits);
        // The deadline covers waiting for a worker as well as the check. The permit travels
        // with the blocking task, so a timed out request keeps its worker slot until the
        // check actually finishes.
        let work = async move {
            let permit = permits.acquire_owned().await?;
            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                check.check(input)
            });
            Ok::<_, AcquireError>(task.await)
        };

        match tokio::time::timeout(state.request_timeout, work).await {
            Ok(Err(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Worker pool is closed\n").into_response()
            }
            Ok(Ok(Ok(Ok(report)))) => {
                let status = if report.acceptable {
                    StatusCode::OK
                } else {
                    StatusCode::NOT_ACCEPTABLE
                };
                info!(acceptable = report.acceptable, "Checked {}", name);
                (
                    status,
                    [(header::CONTENT_TYPE, "application/xml")],
                    report.content,
                )
                    .into_response()
            }
            Ok(Ok(Ok(Err(e)))) => {
                error!("Processing of {} failed: {}", name, e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)).into_response()
            }
            Ok(Ok(Err(join_error))) => {
                error!("Worker for {} failed: {}", name, join_error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(
                        "{}\n",
                        CheckError::Concurrency {
                            details: join_error.to_string()
                        }
                    ),
                )
                    .into_response()
            }
            Err(_) => {
                let timeout = CheckError::Timeout {
                    input: name,
                    timeout_seconds: state.request_timeout.as_secs(),
                };
                warn!("{}", timeout);
                (StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", timeout)).into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn health<E: Engine>(State(state): State<DaemonState<E>>) -> Json<HealthStatus> {
    let repository = state.check.repository();
    Json(HealthStatus {
        status: if repository.is_ready() { "UP" } else { "DOWN" },
        name: repository.name().map(str::to_string),
        scenarios: repository
            .scenarios()
            .iter()
            .map(|scenario| scenario.name().to_string())
            .collect(),
        workers: state.workers,
        available_workers: state.permits.available_permits(),
        completed: state.check.completed(),
    })
}

/// Serve until Ctrl-C
pub async fn serve<E: Engine>(check: Arc<Check<E>>, config: DaemonConfig) -> Result<()> {
    let app = router(check, &config);
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(
        "Daemon listening on {} with {} workers",
        listener.local_addr()?,
        config.workers
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Can not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.bind_address(), "localhost:8080");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_request_bytes, 16 * 1024 * 1024);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_health_status_serialization() {
        let status = HealthStatus {
            status: "UP",
            name: Some("Invoices".to_string()),
            scenarios: vec!["Invoice".to_string()],
            workers: 4,
            available_workers: 4,
            completed: 7,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "UP");
        assert_eq!(json["scenarios"][0], "Invoice");
        assert_eq!(json["completed"], 7);
    }
}
