//! POST /events: validate, enforce batch rules, honor idempotency, and insert
//! raw events atomically with the ledger update.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use super::ApiState;
use crate::audit;
use crate::events::schema;
use crate::metrics::PipelineMetrics;
use crate::store::ingest as ingest_store;
use crate::store::ingest::LedgerOutcome;

pub async fn post_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_sha256 = hex_sha256(&body);
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    // 1. Parse.
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return reject(
                &state,
                None,
                StatusCode::BAD_REQUEST,
                "invalid_json",
                json!([{"path": "", "keyword": "parse", "params": {}, "message": e.to_string()}]),
                None,
            )
            .await;
        }
    };

    // 2. Validate against the registry.
    let events = match schema::validate_batch(&parsed) {
        Ok(events) => events,
        Err(errors) => {
            let errors_json = serde_json::to_value(&errors).unwrap_or_else(|_| json!([]));
            return reject(
                &state,
                None,
                StatusCode::BAD_REQUEST,
                "schema_invalid",
                errors_json,
                Some(&parsed),
            )
            .await;
        }
    };

    // 3. Batch rules: non-empty, single tenant.
    if events.is_empty() {
        return reject(
            &state,
            None,
            StatusCode::BAD_REQUEST,
            "empty_batch",
            json!([]),
            Some(&parsed),
        )
        .await;
    }
    let tenant_id = events[0].envelope.tenant_id.clone();
    if events.iter().any(|e| e.envelope.tenant_id != tenant_id) {
        return reject(
            &state,
            None,
            StatusCode::BAD_REQUEST,
            "mixed_tenant_batch",
            json!([]),
            Some(&parsed),
        )
        .await;
    }

    // 4. Idempotency ledger.
    if let Some(key) = &idempotency_key {
        match ingest_store::begin_ledger(&state.pool, &tenant_id, key, &request_sha256).await {
            Ok(LedgerOutcome::Fresh) => {}
            Ok(LedgerOutcome::Completed { status, body }) => {
                let status =
                    StatusCode::from_u16(status as u16).unwrap_or(StatusCode::OK);
                return (status, Json(body)).into_response();
            }
            Ok(LedgerOutcome::InProgress) => {
                return (
                    StatusCode::ACCEPTED,
                    Json(json!({
                        "ok": false,
                        "status": "processing",
                        "request_idempotency_key": key,
                    })),
                )
                    .into_response();
            }
            Ok(LedgerOutcome::Conflict) => {
                PipelineMetrics::incr(&state.metrics.http_rejected_total);
                return (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "ok": false,
                        "error": "idempotency key reuse with different payload or failed prior request",
                        "request_idempotency_key": key,
                    })),
                )
                    .into_response();
            }
            Err(e) => {
                error!("Idempotency ledger lookup failed: {:#}", e);
                return internal_failure(&state, &tenant_id, idempotency_key.as_deref(), &parsed)
                    .await;
            }
        }
    }

    // 5. Raw-event insert, atomically with the ledger completion.
    let raw_items = batch_items(&parsed);
    let pairs: Vec<_> = events.into_iter().zip(raw_items.into_iter()).collect();
    let received = pairs.len() as u64;

    let insert_result: anyhow::Result<(u64, Value)> = async {
        let mut tx = state.pool.begin().await?;
        let inserted =
            ingest_store::insert_raw_events(&mut tx, &pairs, idempotency_key.as_deref()).await?;
        let response_body = json!({
            "ok": true,
            "schema_version": crate::events::SCHEMA_VERSION,
            "tenant_id": tenant_id.clone(),
            "received_events": received,
            "inserted_events": inserted,
            "duplicate_events": received - inserted,
            "request_idempotency_key": idempotency_key.clone(),
        });
        if let Some(key) = &idempotency_key {
            ingest_store::complete_ledger(
                &mut tx,
                &tenant_id,
                key,
                StatusCode::OK.as_u16() as i32,
                &response_body,
            )
            .await?;
        }
        tx.commit().await?;
        Ok((inserted, response_body))
    }
    .await;

    match insert_result {
        Ok((inserted, response_body)) => {
            PipelineMetrics::add(&state.metrics.events_received_total, received);
            PipelineMetrics::add(&state.metrics.events_inserted_total, inserted);
            PipelineMetrics::add(&state.metrics.events_duplicate_total, received - inserted);
            info!(
                tenant = %tenant_id,
                received,
                inserted,
                "Accepted event batch"
            );
            audit::record(
                &state.pool,
                Some(&tenant_id),
                "ingest",
                "events.accepted",
                json!({
                    "received": received,
                    "inserted": inserted,
                    "request_sha256": request_sha256,
                    "idempotency_key": idempotency_key,
                }),
            )
            .await;
            Json(response_body).into_response()
        }
        Err(e) => {
            error!(tenant = %tenant_id, "Raw event insert failed: {:#}", e);
            internal_failure(&state, &tenant_id, idempotency_key.as_deref(), &parsed).await
        }
    }
}

/// The per-event JSON documents in batch order. Call only after
/// `validate_batch` succeeded on the same value.
fn batch_items(parsed: &Value) -> Vec<Value> {
    match parsed {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => match obj.get("events") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Reject the request: dead-letter the body with the validator errors, count
/// it, and answer with the failure status.
async fn reject(
    state: &ApiState,
    tenant_id: Option<&str>,
    status: StatusCode,
    reason: &str,
    errors: Value,
    body: Option<&Value>,
) -> Response {
    PipelineMetrics::incr(&state.metrics.http_rejected_total);
    PipelineMetrics::incr(&state.metrics.events_dead_lettered_total);
    if let Err(e) = ingest_store::dead_letter(&state.pool, tenant_id, reason, errors.clone(), body).await
    {
        warn!(reason, "Dead-letter write failed: {}", e);
    }
    (
        status,
        Json(json!({"ok": false, "error": reason, "errors": errors})),
    )
        .into_response()
}

/// Database failure after validation: dead-letter, mark the ledger failed,
/// answer 500.
async fn internal_failure(
    state: &ApiState,
    tenant_id: &str,
    idempotency_key: Option<&str>,
    body: &Value,
) -> Response {
    PipelineMetrics::incr(&state.metrics.events_dead_lettered_total);
    if let Err(e) = ingest_store::dead_letter(
        &state.pool,
        Some(tenant_id),
        "database_error",
        json!([]),
        Some(body),
    )
    .await
    {
        warn!("Dead-letter write failed: {}", e);
    }
    if let Some(key) = idempotency_key {
        if let Err(e) = ingest_store::fail_ledger(&state.pool, tenant_id, key).await {
            warn!("Ledger failure update failed: {}", e);
        }
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"ok": false, "error": "internal"})),
    )
        .into_response()
}
