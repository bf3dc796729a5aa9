//! Hourly metric rollups: one upserted row per
//! `(workflow, agent, version, hour)` with means, stddevs, and interpolated
//! percentiles over the evaluation records.

use sqlx::PgPool;
use tracing::info;

use crate::audit;
use crate::config::Config;

pub async fn run(pool: &PgPool, config: &Config) -> anyhow::Result<()> {
    let tenant_id = &config.jobs.tenant_id;
    let upserted = materialize_rollups(pool, tenant_id, config.jobs.lookback_hours).await?;
    info!(tenant = %tenant_id, upserted, "Rollup job complete");
    audit::record(
        pool,
        Some(tenant_id),
        "job:rollup",
        "rollups.materialized",
        serde_json::json!({"upserted": upserted, "lookback_hours": config.jobs.lookback_hours}),
    )
    .await;
    Ok(())
}

/// Derive and upsert the hour-truncated group statistics for every evaluation
/// inside the lookback window. Returns the number of upserted rows.
pub async fn materialize_rollups(
    pool: &PgPool,
    tenant_id: &str,
    lookback_hours: i64,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO metric_rollups_hourly
            (tenant_id, workflow_id, agent_id, agent_version, hour_bucket, run_count,
             latency_mean, latency_stddev, latency_p95,
             faithfulness_mean, faithfulness_stddev,
             faithfulness_p05, faithfulness_p10, faithfulness_p50, faithfulness_p95,
             quality_mean, quality_stddev,
             quality_p05, quality_p10, quality_p50, quality_p95,
             anomaly_count, updated_at)
        SELECT tenant_id, workflow_id, agent_id, agent_version,
               date_trunc('hour', scoring_timestamp) AS hour_bucket,
               COUNT(*),
               AVG(latency_ms), stddev_samp(latency_ms),
               percentile_cont(0.95) WITHIN GROUP (ORDER BY latency_ms),
               AVG(faithfulness), stddev_samp(faithfulness),
               percentile_cont(0.05) WITHIN GROUP (ORDER BY faithfulness),
               percentile_cont(0.10) WITHIN GROUP (ORDER BY faithfulness),
               percentile_cont(0.50) WITHIN GROUP (ORDER BY faithfulness),
               percentile_cont(0.95) WITHIN GROUP (ORDER BY faithfulness),
               AVG(run_quality_score), stddev_samp(run_quality_score),
               percentile_cont(0.05) WITHIN GROUP (ORDER BY run_quality_score),
               percentile_cont(0.10) WITHIN GROUP (ORDER BY run_quality_score),
               percentile_cont(0.50) WITHIN GROUP (ORDER BY run_quality_score),
               percentile_cont(0.95) WITHIN GROUP (ORDER BY run_quality_score),
               COUNT(*) FILTER (WHERE anomaly_flag),
               now()
        FROM evaluation_records
        WHERE tenant_id = $1
          AND scoring_timestamp >= now() - make_interval(hours => $2::int)
          AND workflow_id IS NOT NULL
          AND agent_id IS NOT NULL
          AND agent_version IS NOT NULL
        GROUP BY tenant_id, workflow_id, agent_id, agent_version,
                 date_trunc('hour', scoring_timestamp)
        ON CONFLICT (tenant_id, workflow_id, agent_id, agent_version, hour_bucket)
        DO UPDATE SET
            run_count = EXCLUDED.run_count,
            latency_mean = EXCLUDED.latency_mean,
            latency_stddev = EXCLUDED.latency_stddev,
            latency_p95 = EXCLUDED.latency_p95,
            faithfulness_mean = EXCLUDED.faithfulness_mean,
            faithfulness_stddev = EXCLUDED.faithfulness_stddev,
            faithfulness_p05 = EXCLUDED.faithfulness_p05,
            faithfulness_p10 = EXCLUDED.faithfulness_p10,
            faithfulness_p50 = EXCLUDED.faithfulness_p50,
            faithfulness_p95 = EXCLUDED.faithfulness_p95,
            quality_mean = EXCLUDED.quality_mean,
            quality_stddev = EXCLUDED.quality_stddev,
            quality_p05 = EXCLUDED.quality_p05,
            quality_p10 = EXCLUDED.quality_p10,
            quality_p50 = EXCLUDED.quality_p50,
            quality_p95 = EXCLUDED.quality_p95,
            anomaly_count = EXCLUDED.anomaly_count,
            updated_at = now()
        "#,
    )
    .bind(tenant_id)
    .bind(lookback_hours as i32)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
