//! HTTP surface: the ingest endpoint, the tenant-scoped query endpoints, and
//! the open ops endpoints (/healthz, /metrics).

mod handler;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::metrics::PipelineMetrics;
use crate::store::queries;

#[derive(Clone)]
pub struct ApiState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub metrics: Arc<PipelineMetrics>,
}

pub async fn serve(pool: PgPool, config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let max_body_bytes = config.max_body_bytes;
    let state = ApiState {
        pool,
        config: Arc::new(config),
        metrics: Arc::new(PipelineMetrics::new()),
    };

    let protected = Router::new()
        .route("/events", post(handler::post_events))
        .route("/metrics/agents", get(get_agent_metrics))
        .route("/metrics/workflows", get(get_workflow_metrics))
        .route("/anomalies", get(get_anomalies))
        .route("/shifts", get(get_shifts))
        .route("/actions/recommended", get(get_recommended_actions))
        .route("/backtests", get(get_backtests))
        .route("/signals/:id", get(get_signal))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus_metrics))
        .merge(protected)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Ingest server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Ingest server stopped");
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(state): State<ApiState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    PipelineMetrics::incr(&state.metrics.http_requests_total);

    // Auth is disabled when no keys are configured.
    if state.config.api_keys.is_empty() {
        return Ok(next.run(request).await);
    }

    let presented = headers
        .get("x-api-key")
        .or_else(|| headers.get("authorization"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        .unwrap_or("");

    if state.config.api_keys.iter().any(|k| k == presented) {
        Ok(next.run(request).await)
    } else {
        PipelineMetrics::incr(&state.metrics.http_rejected_total);
        Err(StatusCode::UNAUTHORIZED)
    }
}

// ---------------------------------------------------------------------------
// Ops endpoints (always open)
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<ApiState>) -> Response {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => {
            warn!("Health check database ping failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "database": "unreachable"})),
            )
                .into_response()
        }
    }
}

async fn prometheus_metrics(State(state): State<ApiState>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Query endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListParams {
    limit: Option<i64>,
    status: Option<String>,
    hours: Option<i64>,
}

fn tenant_from(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"ok": false, "error": "missing X-Tenant-Id header"})),
            )
                .into_response()
        })
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(100).clamp(1, 1000)
}

fn rows_response(tenant_id: &str, rows: Vec<serde_json::Value>) -> Response {
    Json(json!({"ok": true, "tenant_id": tenant_id, "rows": rows})).into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    warn!("Query endpoint failed: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"ok": false, "error": "internal"})),
    )
        .into_response()
}

async fn get_agent_metrics(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match queries::agent_metrics(&state.pool, &tenant_id, params.hours.unwrap_or(24)).await {
        Ok(rows) => rows_response(&tenant_id, rows),
        Err(e) => internal_error(e),
    }
}

async fn get_workflow_metrics(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match queries::workflow_metrics(&state.pool, &tenant_id, params.hours.unwrap_or(24)).await {
        Ok(rows) => rows_response(&tenant_id, rows),
        Err(e) => internal_error(e),
    }
}

async fn get_anomalies(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match queries::recent_anomalies(&state.pool, &tenant_id, clamp_limit(params.limit)).await {
        Ok(rows) => rows_response(&tenant_id, rows),
        Err(e) => internal_error(e),
    }
}

async fn get_shifts(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match queries::recent_shifts(&state.pool, &tenant_id, clamp_limit(params.limit)).await {
        Ok(rows) => rows_response(&tenant_id, rows),
        Err(e) => internal_error(e),
    }
}

async fn get_recommended_actions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let status = params.status.as_deref().unwrap_or(crate::actions::STATUS_OPEN);
    match queries::recommended_actions(&state.pool, &tenant_id, status, clamp_limit(params.limit))
        .await
    {
        Ok(rows) => rows_response(&tenant_id, rows),
        Err(e) => internal_error(e),
    }
}

async fn get_backtests(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match queries::recent_backtests(&state.pool, &tenant_id, clamp_limit(params.limit)).await {
        Ok(rows) => rows_response(&tenant_id, rows),
        Err(e) => internal_error(e),
    }
}

async fn get_signal(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let signal_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"ok": false, "error": "signal id must be a UUID"})),
            )
                .into_response();
        }
    };
    match queries::signal_by_id(&state.pool, &tenant_id, signal_id).await {
        Ok(rows) => rows_response(&tenant_id, rows),
        Err(e) => internal_error(e),
    }
}
