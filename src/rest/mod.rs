//! REST submission surface (§C.2) — an Axum router fronting the core with
//! `POST /api/v1/jobs`, job/agent/dead-letter browsing, and a minimal
//! `/api/v1/metrics` endpoint.
//!
//! Grounded on `rest::mod`'s `build_router(ctx)` / `start_rest_server` shape:
//! one `Router` built from the shared context, CORS layered on with
//! `tower-http`, routes split by resource into their own handler functions.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::domain::{Capability, JobRequest, JobStatus};
use crate::error::OrbitMeshError;
use crate::OrbitMeshContext;

pub fn build_router(ctx: Arc<OrbitMeshContext>) -> Router {
    Router::new()
        .route("/api/v1/jobs", post(submit_job).get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/dead-letter", get(list_dead_letter))
        .route("/api/v1/health", get(health))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/events", get(dashboard_events))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn serve(ctx: Arc<OrbitMeshContext>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let router = build_router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "REST API listening");
    let mut shutdown = ctx.shutdown_rx();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

fn map_err(e: OrbitMeshError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &e {
        OrbitMeshError::Validation(_) => StatusCode::BAD_REQUEST,
        OrbitMeshError::UnknownAgent(_) | OrbitMeshError::UnknownJob(_) => StatusCode::NOT_FOUND,
        OrbitMeshError::InvalidState { .. } => StatusCode::CONFLICT,
        OrbitMeshError::DuplicateInFlight(_) => StatusCode::CONFLICT,
        OrbitMeshError::CircuitOpen(_) | OrbitMeshError::AgentOverloaded(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrbitMeshError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody { error: e.to_string() }))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct SubmitJobBody {
    command: String,
    #[serde(default)]
    parameters: Vec<u8>,
    pattern: Option<String>,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    required_tags: Vec<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    max_retries: u32,
    timeout_secs: Option<u64>,
    idempotency_key: Option<String>,
    correlation_id: Option<String>,
}

async fn submit_job(
    State(ctx): State<Arc<OrbitMeshContext>>,
    Json(body): Json<SubmitJobBody>,
) -> impl IntoResponse {
    let request = JobRequest {
        id: crate::orchestrator::Orchestrator::new_job_id(),
        idempotency_key: body.idempotency_key,
        command: body.command,
        parameters: body.parameters,
        pattern: body.pattern,
        required_capabilities: body.required_capabilities.into_iter().map(Capability::named).collect(),
        required_tags: body.required_tags,
        priority: body.priority,
        max_retries: body.max_retries,
        timeout: body.timeout_secs.map(std::time::Duration::from_secs),
        correlation_id: body.correlation_id,
        metadata: Default::default(),
    };
    let result = ctx.orchestrator.submit_job(request).await;
    (StatusCode::ACCEPTED, Json(result))
}

#[derive(Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    agent_id: Option<String>,
}

async fn list_jobs(State(ctx): State<Arc<OrbitMeshContext>>, Query(q): Query<ListJobsQuery>) -> impl IntoResponse {
    let status = q.status.as_deref().and_then(parse_status);
    let jobs = ctx.orchestrator.list_jobs(status, q.agent_id.as_deref()).await;
    Json(jobs)
}

fn parse_status(s: &str) -> Option<JobStatus> {
    Some(match s {
        "pending" => JobStatus::Pending,
        "assigned" => JobStatus::Assigned,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "timed_out" => JobStatus::TimedOut,
        _ => return None,
    })
}

async fn get_job(State(ctx): State<Arc<OrbitMeshContext>>, Path(id): Path<String>) -> impl IntoResponse {
    match ctx.orchestrator.get_job(&id).await {
        Some(job) => (StatusCode::OK, Json(job)).into_response(),
        None => map_err(OrbitMeshError::UnknownJob(id)).into_response(),
    }
}

async fn cancel_job(State(ctx): State<Arc<OrbitMeshContext>>, Path(id): Path<String>) -> impl IntoResponse {
    match ctx.orchestrator.cancel_job(&id).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => StatusCode::CONFLICT.into_response(),
        Err(e) => map_err(e).into_response(),
    }
}

async fn list_agents(State(ctx): State<Arc<OrbitMeshContext>>) -> impl IntoResponse {
    Json(ctx.registry.list().await)
}

async fn list_dead_letter(State(ctx): State<Arc<OrbitMeshContext>>) -> impl IntoResponse {
    Json(ctx.orchestrator.dead_letter().list().await)
}

async fn health(State(ctx): State<Arc<OrbitMeshContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "agents_connected": ctx.registry.list().await.iter().filter(|a| a.is_connected()).count(),
    }))
}

#[derive(Serialize)]
struct MetricsBody {
    pending_jobs: usize,
    agents_by_status: std::collections::HashMap<String, usize>,
    dead_letter_count: usize,
}

/// Server-sent-event feed of `DashboardEvent`s (§4.12) for dashboard clients
/// that want to observe job/agent state changes without polling.
async fn dashboard_events(
    State(ctx): State<Arc<OrbitMeshContext>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(ctx.events.subscribe()).filter_map(|item| {
        item.ok().map(|event| {
            Event::default()
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().data("serialization error"))
        })
    });
    Sse::new(stream.map(Ok)).keep_alive(KeepAlive::default())
}

async fn metrics(State(ctx): State<Arc<OrbitMeshContext>>) -> impl IntoResponse {
    let agents = ctx.registry.list().await;
    let mut agents_by_status = std::collections::HashMap::new();
    for agent in &agents {
        *agents_by_status.entry(agent.status.as_str().to_string()).or_insert(0) += 1;
    }
    Json(MetricsBody {
        pending_jobs: ctx.jobs.get_pending().await.len(),
        agents_by_status,
        dead_letter_count: ctx.orchestrator.dead_letter().count().await,
    })
}
