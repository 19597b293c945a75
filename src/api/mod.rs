//! HTTP API module for the stint scheduler.
//!
//! Provides REST endpoints for submitting jobs, managing recurring jobs,
//! querying state and controlling the scheduler.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{ApiState, ListJobsQuery, PersonQuery};
pub use responses::*;

use axum::{
    Router,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::client::JobClient;
use crate::scheduler::{RecurringScheduler, SchedulerHandle};
use crate::storage::JobStore;

/// Configuration for the API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8565,
        }
    }
}

impl ApiConfig {
    /// Create a new API config with custom host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address.
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }
}

/// Build the API router with all endpoints.
pub fn build_router<S: JobStore + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health))
        // Scheduler control
        .route(
            "/api/scheduler/state",
            get(handlers::get_scheduler_state::<S>),
        )
        .route("/api/scheduler/pause", post(handlers::pause_scheduler::<S>))
        .route(
            "/api/scheduler/resume",
            post(handlers::resume_scheduler::<S>),
        )
        // Jobs
        .route(
            "/api/jobs",
            get(handlers::list_jobs::<S>).post(handlers::create_job::<S>),
        )
        .route(
            "/api/jobs/{job_id}",
            get(handlers::get_job::<S>).delete(handlers::delete_job::<S>),
        )
        .route("/api/stats", get(handlers::stats::<S>))
        // Recurring jobs
        .route(
            "/api/recurring",
            get(handlers::list_recurring::<S>).post(handlers::upsert_recurring::<S>),
        )
        .route("/api/recurring/{key}", delete(handlers::delete_recurring::<S>))
        .route(
            "/api/recurring/{key}/trigger",
            post(handlers::trigger_recurring::<S>),
        )
        // Demo
        .route("/api/people/create", post(handlers::create_person::<S>))
        .route("/api/people/schedule", post(handlers::schedule_person::<S>))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from the scheduler's submission paths.
///
/// Take `client` and `recurring` from the scheduler before `start` consumes
/// it, then pass the handle it returns.
pub fn create_api_state<S: JobStore + 'static>(
    handle: SchedulerHandle,
    client: JobClient<S>,
    recurring: RecurringScheduler<S>,
) -> ApiState<S> {
    ApiState {
        handle,
        client,
        recurring,
    }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server<S: JobStore + 'static>(
    config: ApiConfig,
    state: ApiState<S>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);
    let addr = config.socket_addr()?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
