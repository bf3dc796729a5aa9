//! Read-only projections backing the tenant-scoped query endpoints.

use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::normalize;

/// Per-(workflow, agent, version) aggregates over the recent rollups.
pub async fn agent_metrics(pool: &PgPool, tenant_id: &str, hours: i64) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query(
        r#"
        SELECT workflow_id, agent_id, agent_version,
               SUM(run_count)::bigint AS run_count,
               AVG(quality_mean) AS quality_mean,
               AVG(faithfulness_mean) AS faithfulness_mean,
               MAX(latency_p95) AS latency_p95,
               SUM(anomaly_count)::bigint AS anomaly_count
        FROM metric_rollups_hourly
        WHERE tenant_id = $1
          AND hour_bucket >= now() - make_interval(hours => $2::int)
        GROUP BY workflow_id, agent_id, agent_version
        ORDER BY workflow_id, agent_id, agent_version
        "#,
    )
    .bind(tenant_id)
    .bind(hours as i32)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            json!({
                "workflow_id": row.get::<String, _>("workflow_id"),
                "agent_id": row.get::<String, _>("agent_id"),
                "agent_version": row.get::<String, _>("agent_version"),
                "run_count": row.get::<i64, _>("run_count"),
                "quality_mean": row.get::<Option<f64>, _>("quality_mean"),
                "faithfulness_mean": row.get::<Option<f64>, _>("faithfulness_mean"),
                "latency_p95": row.get::<Option<f64>, _>("latency_p95"),
                "anomaly_count": row.get::<i64, _>("anomaly_count"),
            })
        })
        .collect())
}

/// Per-workflow aggregates with the shrunk quality estimate: small samples are
/// pulled toward the prior so a workflow with three lucky runs does not outrank
/// one with three thousand.
pub async fn workflow_metrics(
    pool: &PgPool,
    tenant_id: &str,
    hours: i64,
) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query(
        r#"
        SELECT workflow_id,
               SUM(run_count)::bigint AS run_count,
               AVG(quality_mean) AS quality_mean,
               MAX(latency_p95) AS latency_p95,
               SUM(anomaly_count)::bigint AS anomaly_count
        FROM metric_rollups_hourly
        WHERE tenant_id = $1
          AND hour_bucket >= now() - make_interval(hours => $2::int)
        GROUP BY workflow_id
        ORDER BY workflow_id
        "#,
    )
    .bind(tenant_id)
    .bind(hours as i32)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let run_count: i64 = row.get("run_count");
            let quality_mean: Option<f64> = row.get("quality_mean");
            let anomaly_count: i64 = row.get("anomaly_count");
            let quality_shrunk = quality_mean.map(|mean| {
                normalize::shrunk_mean(mean, run_count.max(0) as u64, normalize::SHRINKAGE_PRIOR)
            });
            let anomaly_rate = if run_count > 0 {
                anomaly_count as f64 / run_count as f64
            } else {
                0.0
            };
            json!({
                "workflow_id": row.get::<String, _>("workflow_id"),
                "run_count": run_count,
                "quality_mean": quality_mean,
                "quality_shrunk": quality_shrunk,
                "latency_p95": row.get::<Option<f64>, _>("latency_p95"),
                "anomaly_count": anomaly_count,
                "anomaly_rate": anomaly_rate,
            })
        })
        .collect())
}

pub async fn recent_anomalies(
    pool: &PgPool,
    tenant_id: &str,
    limit: i64,
) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query(
        r#"
        SELECT anomaly_id, evaluation_id, workflow_id, agent_id, agent_version,
               metric_name, method, metric_value, threshold_low, threshold_high,
               z_score, details, detected_at
        FROM anomalies
        WHERE tenant_id = $1
        ORDER BY detected_at DESC
        LIMIT $2
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            json!({
                "anomaly_id": row.get::<Uuid, _>("anomaly_id"),
                "evaluation_id": row.get::<Uuid, _>("evaluation_id"),
                "workflow_id": row.get::<Option<String>, _>("workflow_id"),
                "agent_id": row.get::<Option<String>, _>("agent_id"),
                "agent_version": row.get::<Option<String>, _>("agent_version"),
                "metric_name": row.get::<String, _>("metric_name"),
                "method": row.get::<String, _>("method"),
                "metric_value": row.get::<Option<f64>, _>("metric_value"),
                "threshold_low": row.get::<Option<f64>, _>("threshold_low"),
                "threshold_high": row.get::<Option<f64>, _>("threshold_high"),
                "z_score": row.get::<Option<f64>, _>("z_score"),
                "details": row.get::<Value, _>("details"),
                "detected_at": row.get::<chrono::DateTime<chrono::Utc>, _>("detected_at").to_rfc3339(),
            })
        })
        .collect())
}

pub async fn recent_shifts(
    pool: &PgPool,
    tenant_id: &str,
    limit: i64,
) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query(
        r#"
        SELECT shift_id, workflow_id, agent_id, agent_version, metric_name,
               window_a_start, window_a_end, window_b_start, window_b_end,
               method, p_value, bh_adjusted_p_value, effect_size, significant,
               details, detected_at
        FROM performance_shifts
        WHERE tenant_id = $1
        ORDER BY detected_at DESC
        LIMIT $2
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            json!({
                "shift_id": row.get::<Uuid, _>("shift_id"),
                "workflow_id": row.get::<String, _>("workflow_id"),
                "agent_id": row.get::<String, _>("agent_id"),
                "agent_version": row.get::<String, _>("agent_version"),
                "metric_name": row.get::<String, _>("metric_name"),
                "window_a_start": row.get::<chrono::DateTime<chrono::Utc>, _>("window_a_start").to_rfc3339(),
                "window_a_end": row.get::<chrono::DateTime<chrono::Utc>, _>("window_a_end").to_rfc3339(),
                "window_b_start": row.get::<chrono::DateTime<chrono::Utc>, _>("window_b_start").to_rfc3339(),
                "window_b_end": row.get::<chrono::DateTime<chrono::Utc>, _>("window_b_end").to_rfc3339(),
                "method": row.get::<String, _>("method"),
                "p_value": row.get::<Option<f64>, _>("p_value"),
                "bh_adjusted_p_value": row.get::<Option<f64>, _>("bh_adjusted_p_value"),
                "effect_size": row.get::<Option<f64>, _>("effect_size"),
                "significant": row.get::<bool, _>("significant"),
                "details": row.get::<Value, _>("details"),
                "detected_at": row.get::<chrono::DateTime<chrono::Utc>, _>("detected_at").to_rfc3339(),
            })
        })
        .collect())
}

pub async fn recommended_actions(
    pool: &PgPool,
    tenant_id: &str,
    status: &str,
    limit: i64,
) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query(
        r#"
        SELECT action_id, action_type, target, payload, decided_by, status, created_at
        FROM recommended_actions
        WHERE tenant_id = $1 AND status = $2
        ORDER BY created_at DESC
        LIMIT $3
        "#,
    )
    .bind(tenant_id)
    .bind(status)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            json!({
                "action_id": row.get::<Uuid, _>("action_id"),
                "action_type": row.get::<String, _>("action_type"),
                "target": row.get::<Value, _>("target"),
                "payload": row.get::<Value, _>("payload"),
                "decided_by": row.get::<String, _>("decided_by"),
                "status": row.get::<String, _>("status"),
                "created_at": row.get::<chrono::DateTime<chrono::Utc>, _>("created_at").to_rfc3339(),
            })
        })
        .collect())
}

pub async fn recent_backtests(
    pool: &PgPool,
    tenant_id: &str,
    limit: i64,
) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query(
        r#"
        SELECT backtest_id, dataset_version, horizon, window_start, window_end,
               cost_bps, code_version, status, summary, created_at
        FROM backtest_runs
        WHERE tenant_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            json!({
                "backtest_id": row.get::<Uuid, _>("backtest_id"),
                "dataset_version": row.get::<String, _>("dataset_version"),
                "horizon": row.get::<String, _>("horizon"),
                "window_start": row.get::<chrono::DateTime<chrono::Utc>, _>("window_start").to_rfc3339(),
                "window_end": row.get::<chrono::DateTime<chrono::Utc>, _>("window_end").to_rfc3339(),
                "cost_bps": row.get::<f64, _>("cost_bps"),
                "code_version": row.get::<String, _>("code_version"),
                "status": row.get::<String, _>("status"),
                "summary": row.get::<Value, _>("summary"),
                "created_at": row.get::<chrono::DateTime<chrono::Utc>, _>("created_at").to_rfc3339(),
            })
        })
        .collect())
}

pub async fn signal_by_id(
    pool: &PgPool,
    tenant_id: &str,
    signal_id: Uuid,
) -> anyhow::Result<Vec<Value>> {
    let rows = sqlx::query(
        r#"
        SELECT signal_id, orchestration_run_id, event_time, horizon,
               instrument_universe, signal_value, confidence, constraints, created_at
        FROM signals
        WHERE tenant_id = $1 AND signal_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(signal_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            json!({
                "signal_id": row.get::<Uuid, _>("signal_id"),
                "orchestration_run_id": row.get::<Option<String>, _>("orchestration_run_id"),
                "event_time": row.get::<chrono::DateTime<chrono::Utc>, _>("event_time").to_rfc3339(),
                "horizon": row.get::<String, _>("horizon"),
                "instrument_universe": row.get::<Value, _>("instrument_universe"),
                "signal_value": row.get::<Value, _>("signal_value"),
                "confidence": row.get::<Option<f64>, _>("confidence"),
                "constraints": row.get::<Option<Value>, _>("constraints"),
            })
        })
        .collect())
}
