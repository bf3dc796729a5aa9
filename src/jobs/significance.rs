//! Version-over-version significance testing.
//!
//! Detector A compares two adjacent time windows per group with Welch's
//! t-test, then corrects across all groups with Benjamini–Hochberg so a fleet
//! of agents does not drown the operator in false positives.
//!
//! Detector B watches each group's hourly mean-quality series for slow drifts
//! (EWMA against an early baseline) and sustained level changes (two-sided
//! CUSUM).

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{active_groups, metric_column, Group};
use crate::config::Config;
use crate::stats;

pub const METHOD_WELCH: &str = "welch_normal_approx";
pub const METHOD_EWMA: &str = "ewma";
pub const METHOD_CUSUM: &str = "cusum";

const EWMA_LAMBDA: f64 = 0.3;
const EWMA_TRIGGER: f64 = 0.15;
const CUSUM_SLACK: f64 = 0.02;
const CUSUM_THRESHOLD: f64 = 0.2;
const SERIES_MIN_POINTS: usize = 12;
const SERIES_MIN_HOURS: i64 = 24;
const BASELINE_POINTS: usize = 6;

pub async fn run(pool: &PgPool, config: &Config) -> anyhow::Result<()> {
    let tenant_id = &config.jobs.tenant_id;
    let now = Utc::now();

    let window_shifts = window_comparison(pool, config, now).await?;
    let series_shifts = series_change_points(pool, config, now).await?;

    info!(
        tenant = %tenant_id,
        window_shifts,
        series_shifts,
        "Significance job complete"
    );
    Ok(())
}

/// Detector A: Welch per group over windows A = [now-W, now) and
/// B = [now-2W, now-W), BH-corrected across groups.
async fn window_comparison(
    pool: &PgPool,
    config: &Config,
    now: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let tenant_id = &config.jobs.tenant_id;
    let window = Duration::hours(config.jobs.window_hours);
    let a_start = now - window;
    let b_start = now - window - window;
    let column = metric_column(&config.jobs.significance_metric);

    let groups = active_groups(pool, tenant_id, 2 * config.jobs.window_hours).await?;

    let mut tested: Vec<(Group, stats::WelchResult)> = Vec::new();
    for group in groups {
        let a_vals = metric_values(pool, tenant_id, &group, column, a_start, now).await?;
        let b_vals = metric_values(pool, tenant_id, &group, column, b_start, a_start).await?;
        let Some(welch) = stats::welch_t_test(&a_vals, &b_vals) else {
            debug!(
                workflow = %group.workflow_id,
                agent = %group.agent_id,
                n_a = a_vals.len(),
                n_b = b_vals.len(),
                "Skipping group with insufficient window samples"
            );
            continue;
        };
        tested.push((group, welch));
    }

    if tested.is_empty() {
        return Ok(0);
    }

    let p_values: Vec<f64> = tested.iter().map(|(_, w)| w.p_value).collect();
    let corrected = stats::benjamini_hochberg(&p_values, config.jobs.alpha);

    let mut written = 0u64;
    for ((group, welch), bh) in tested.iter().zip(corrected.iter()) {
        sqlx::query(
            r#"
            INSERT INTO performance_shifts
                (tenant_id, shift_id, workflow_id, agent_id, agent_version, metric_name,
                 window_a_start, window_a_end, window_b_start, window_b_end,
                 method, p_value, bh_adjusted_p_value, effect_size, significant, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(tenant_id)
        .bind(Uuid::new_v4())
        .bind(&group.workflow_id)
        .bind(&group.agent_id)
        .bind(&group.agent_version)
        .bind(column)
        .bind(a_start)
        .bind(now)
        .bind(b_start)
        .bind(a_start)
        .bind(METHOD_WELCH)
        .bind(finite_or_none(welch.p_value))
        .bind(finite_or_none(bh.q_value))
        .bind(finite_or_none(welch.effect_size))
        .bind(bh.significant)
        .bind(json!({
            "t": finite_or_none(welch.t),
            "df": finite_or_none(welch.df),
            "mean_a": welch.mean_a,
            "mean_b": welch.mean_b,
            "var_a": welch.var_a,
            "var_b": welch.var_b,
            "n_a": welch.n_a,
            "n_b": welch.n_b,
        }))
        .execute(pool)
        .await?;
        written += 1;
    }
    Ok(written)
}

/// Detector B: EWMA and CUSUM over each group's hourly mean-quality series.
async fn series_change_points(
    pool: &PgPool,
    config: &Config,
    now: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let tenant_id = &config.jobs.tenant_id;
    let lookback = config.jobs.lookback_hours.max(SERIES_MIN_HOURS);
    let groups = active_groups(pool, tenant_id, lookback).await?;

    let mut written = 0u64;
    for group in groups {
        let series = quality_series(pool, tenant_id, &group, lookback).await?;
        if series.len() < SERIES_MIN_POINTS {
            continue;
        }
        let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
        let hours: Vec<DateTime<Utc>> = series.iter().map(|(h, _)| *h).collect();

        let baseline_n = BASELINE_POINTS.min(values.len());
        let baseline = stats::mean(&values[..baseline_n]);
        let baseline_end = hours[baseline_n - 1] + Duration::hours(1);
        let series_end = hours[values.len() - 1] + Duration::hours(1);

        let ewma_series = stats::ewma(&values, EWMA_LAMBDA);
        let ewma_last = ewma_series[ewma_series.len() - 1];
        if (ewma_last - baseline).abs() > EWMA_TRIGGER {
            insert_series_shift(
                pool,
                tenant_id,
                &group,
                METHOD_EWMA,
                baseline_end,
                series_end,
                hours[0],
                baseline_end,
                ewma_last - baseline,
                json!({
                    "baseline": baseline,
                    "ewma_last": ewma_last,
                    "lambda": EWMA_LAMBDA,
                    "trigger": EWMA_TRIGGER,
                    "points": values.len(),
                }),
            )
            .await?;
            written += 1;
        }

        let cusum = stats::cusum(&values, baseline, CUSUM_SLACK, CUSUM_THRESHOLD);
        if cusum.signaled_at_last() {
            let s_pos = *cusum.s_pos.last().unwrap_or(&0.0);
            let s_neg = *cusum.s_neg.last().unwrap_or(&0.0);
            insert_series_shift(
                pool,
                tenant_id,
                &group,
                METHOD_CUSUM,
                baseline_end,
                series_end,
                hours[0],
                baseline_end,
                if s_pos > CUSUM_THRESHOLD { s_pos } else { s_neg },
                json!({
                    "baseline": baseline,
                    "s_pos": s_pos,
                    "s_neg": s_neg,
                    "slack": CUSUM_SLACK,
                    "threshold": CUSUM_THRESHOLD,
                    "points": values.len(),
                }),
            )
            .await?;
            written += 1;
        }
    }
    Ok(written)
}

#[allow(clippy::too_many_arguments)]
async fn insert_series_shift(
    pool: &PgPool,
    tenant_id: &str,
    group: &Group,
    method: &str,
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
    effect_size: f64,
    details: serde_json::Value,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO performance_shifts
            (tenant_id, shift_id, workflow_id, agent_id, agent_version, metric_name,
             window_a_start, window_a_end, window_b_start, window_b_end,
             method, p_value, bh_adjusted_p_value, effect_size, significant, details)
        VALUES ($1, $2, $3, $4, $5, 'mean_quality', $6, $7, $8, $9, $10, NULL, NULL, $11, TRUE, $12)
        "#,
    )
    .bind(tenant_id)
    .bind(Uuid::new_v4())
    .bind(&group.workflow_id)
    .bind(&group.agent_id)
    .bind(&group.agent_version)
    .bind(a_start)
    .bind(a_end)
    .bind(b_start)
    .bind(b_end)
    .bind(method)
    .bind(effect_size)
    .bind(details)
    .execute(pool)
    .await?;

    info!(
        tenant = %tenant_id,
        workflow = %group.workflow_id,
        agent = %group.agent_id,
        version = %group.agent_version,
        method,
        effect_size,
        "Recorded series change point"
    );
    Ok(())
}

async fn metric_values(
    pool: &PgPool,
    tenant_id: &str,
    group: &Group,
    column: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<f64>> {
    // `column` comes from the metric_column whitelist, never from user input.
    let sql = format!(
        "SELECT {column} AS value
         FROM evaluation_records
         WHERE tenant_id = $1 AND workflow_id = $2 AND agent_id = $3 AND agent_version = $4
           AND scoring_timestamp >= $5 AND scoring_timestamp < $6
           AND {column} IS NOT NULL"
    );
    let rows = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(&group.workflow_id)
        .bind(&group.agent_id)
        .bind(&group.agent_version)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get::<f64, _>("value")).collect())
}

async fn quality_series(
    pool: &PgPool,
    tenant_id: &str,
    group: &Group,
    lookback_hours: i64,
) -> anyhow::Result<Vec<(DateTime<Utc>, f64)>> {
    let rows = sqlx::query(
        r#"
        SELECT hour_bucket, quality_mean
        FROM metric_rollups_hourly
        WHERE tenant_id = $1 AND workflow_id = $2 AND agent_id = $3 AND agent_version = $4
          AND hour_bucket >= now() - make_interval(hours => $5::int)
          AND quality_mean IS NOT NULL
        ORDER BY hour_bucket
        "#,
    )
    .bind(tenant_id)
    .bind(&group.workflow_id)
    .bind(&group.agent_id)
    .bind(&group.agent_version)
    .bind(lookback_hours as i32)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get::<DateTime<Utc>, _>("hour_bucket"),
                row.get::<f64, _>("quality_mean"),
            )
        })
        .collect())
}

fn finite_or_none(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_statistics_store_as_null() {
        assert_eq!(finite_or_none(f64::INFINITY), None);
        assert_eq!(finite_or_none(f64::NAN), None);
        assert_eq!(finite_or_none(0.5), Some(0.5));
    }

    #[test]
    fn ewma_trigger_matches_policy() {
        // A series that falls from 0.9 to 0.6 after the baseline must trip
        // the EWMA detector the way the job would see it.
        let mut values = vec![0.9; 6];
        values.extend(vec![0.6; 10]);
        let baseline = stats::mean(&values[..6]);
        let last = *stats::ewma(&values, EWMA_LAMBDA).last().unwrap();
        assert!((last - baseline).abs() > EWMA_TRIGGER);

        // A flat series stays quiet.
        let flat = vec![0.9; 16];
        let flat_last = *stats::ewma(&flat, EWMA_LAMBDA).last().unwrap();
        assert!((flat_last - stats::mean(&flat[..6])).abs() < EWMA_TRIGGER);
    }

    #[test]
    fn cusum_policy_detects_small_sustained_drop() {
        let mut values = vec![0.9; 6];
        values.extend(vec![0.82; 10]);
        let baseline = stats::mean(&values[..6]);
        let result = stats::cusum(&values, baseline, CUSUM_SLACK, CUSUM_THRESHOLD);
        assert!(result.signaled_at_last());
    }
}
