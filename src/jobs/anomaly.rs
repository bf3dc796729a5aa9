//! Per-run anomaly scan.
//!
//! For every active group, the job fetches the most recent evaluations and
//! examines the newest candidates against the history strictly older than each
//! candidate. Checks run in priority order: the hallucination rule trumps
//! everything, then a MAD outlier test on latency, then z-score tests on
//! confidence and faithfulness (the latter flags only the low tail).

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{active_groups, Group};
use crate::config::Config;
use crate::stats;

const MAX_CANDIDATES: usize = 20;
const ROBUST_Z_THRESHOLD: f64 = 3.5;
const Z_THRESHOLD: f64 = 3.0;

#[derive(Debug, Clone)]
struct EvalRow {
    evaluation_id: Uuid,
    latency_ms: f64,
    faithfulness: Option<f64>,
    confidence: Option<f64>,
    hallucination_flag: Option<bool>,
    anomaly_flag: bool,
    scoring_timestamp: DateTime<Utc>,
}

struct Finding {
    metric_name: &'static str,
    method: &'static str,
    metric_value: f64,
    threshold_low: Option<f64>,
    threshold_high: Option<f64>,
    z_score: Option<f64>,
    details: serde_json::Value,
}

pub async fn run(pool: &PgPool, config: &Config) -> anyhow::Result<()> {
    let tenant_id = &config.jobs.tenant_id;
    let groups = active_groups(pool, tenant_id, config.jobs.lookback_hours).await?;
    let mut created = 0u64;

    for group in &groups {
        created += scan_group(pool, tenant_id, group, config).await?;
    }

    info!(
        tenant = %tenant_id,
        groups = groups.len(),
        anomalies = created,
        "Anomaly job complete"
    );
    Ok(())
}

async fn scan_group(
    pool: &PgPool,
    tenant_id: &str,
    group: &Group,
    config: &Config,
) -> anyhow::Result<u64> {
    let rows = fetch_recent(pool, tenant_id, group, config.jobs.per_group_limit).await?;
    if rows.is_empty() {
        return Ok(0);
    }
    if rows.len() < config.jobs.min_history {
        debug!(
            workflow = %group.workflow_id,
            agent = %group.agent_id,
            version = %group.agent_version,
            rows = rows.len(),
            "Group below minimum history, statistical checks disabled"
        );
    }

    let mut created = 0u64;
    for (i, candidate) in rows.iter().take(MAX_CANDIDATES).enumerate() {
        if candidate.anomaly_flag {
            continue;
        }
        // History excludes the candidate and everything newer than it.
        let history = &rows[i + 1..];
        if let Some(finding) = examine(candidate, history, config.jobs.min_history) {
            record_anomaly(pool, tenant_id, group, candidate, &finding).await?;
            created += 1;
        }
    }
    Ok(created)
}

fn examine(candidate: &EvalRow, history: &[EvalRow], min_history: usize) -> Option<Finding> {
    // 1. Hallucination rule: fires regardless of history size.
    if candidate.hallucination_flag == Some(true) {
        return Some(Finding {
            metric_name: "hallucination_flag",
            method: "rule",
            metric_value: 1.0,
            threshold_low: None,
            threshold_high: None,
            z_score: None,
            details: json!({"rule": "hallucination_flag"}),
        });
    }

    if history.len() < min_history {
        return None;
    }

    // 2. Robust latency outlier.
    let latencies: Vec<f64> = history.iter().map(|r| r.latency_ms).collect();
    let median = stats::median(&latencies);
    let mad = stats::mad(&latencies);
    let z = stats::robust_z(candidate.latency_ms, median, mad);
    if z.abs() > ROBUST_Z_THRESHOLD {
        let spread = ROBUST_Z_THRESHOLD * mad / 0.6745;
        return Some(Finding {
            metric_name: "latency_ms",
            method: "mad",
            metric_value: candidate.latency_ms,
            threshold_low: Some(median - spread),
            threshold_high: Some(median + spread),
            z_score: Some(z),
            details: json!({"median": median, "mad": mad, "history": history.len()}),
        });
    }

    // 3. Confidence z-score.
    if let Some(confidence) = candidate.confidence {
        let values: Vec<f64> = history.iter().filter_map(|r| r.confidence).collect();
        if values.len() >= min_history {
            if let Some(z) = plain_z(confidence, &values) {
                if z.abs() > Z_THRESHOLD {
                    let mean = stats::mean(&values);
                    let sd = stats::sample_stddev(&values);
                    return Some(Finding {
                        metric_name: "confidence",
                        method: "zscore",
                        metric_value: confidence,
                        threshold_low: Some(mean - Z_THRESHOLD * sd),
                        threshold_high: Some(mean + Z_THRESHOLD * sd),
                        z_score: Some(z),
                        details: json!({"mean": mean, "stddev": sd, "history": values.len()}),
                    });
                }
            }
        }
    }

    // 4. Faithfulness z-score, low tail only.
    if let Some(faithfulness) = candidate.faithfulness {
        let values: Vec<f64> = history.iter().filter_map(|r| r.faithfulness).collect();
        if values.len() >= min_history {
            if let Some(z) = plain_z(faithfulness, &values) {
                if z < -Z_THRESHOLD {
                    let mean = stats::mean(&values);
                    let sd = stats::sample_stddev(&values);
                    return Some(Finding {
                        metric_name: "faithfulness",
                        method: "zscore",
                        metric_value: faithfulness,
                        threshold_low: Some(mean - Z_THRESHOLD * sd),
                        threshold_high: None,
                        z_score: Some(z),
                        details: json!({"mean": mean, "stddev": sd, "history": values.len()}),
                    });
                }
            }
        }
    }

    None
}

fn plain_z(x: f64, history: &[f64]) -> Option<f64> {
    let sd = stats::sample_stddev(history);
    if sd == 0.0 {
        return None;
    }
    Some((x - stats::mean(history)) / sd)
}

async fn fetch_recent(
    pool: &PgPool,
    tenant_id: &str,
    group: &Group,
    limit: i64,
) -> anyhow::Result<Vec<EvalRow>> {
    let rows = sqlx::query(
        r#"
        SELECT evaluation_id, latency_ms, faithfulness, confidence,
               hallucination_flag, anomaly_flag, scoring_timestamp
        FROM evaluation_records
        WHERE tenant_id = $1 AND workflow_id = $2 AND agent_id = $3 AND agent_version = $4
        ORDER BY scoring_timestamp DESC
        LIMIT $5
        "#,
    )
    .bind(tenant_id)
    .bind(&group.workflow_id)
    .bind(&group.agent_id)
    .bind(&group.agent_version)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| EvalRow {
            evaluation_id: row.get("evaluation_id"),
            latency_ms: row.get("latency_ms"),
            faithfulness: row.get("faithfulness"),
            confidence: row.get("confidence"),
            hallucination_flag: row.get("hallucination_flag"),
            anomaly_flag: row.get("anomaly_flag"),
            scoring_timestamp: row.get("scoring_timestamp"),
        })
        .collect())
}

/// Write the anomaly and flag the evaluation in one transaction.
async fn record_anomaly(
    pool: &PgPool,
    tenant_id: &str,
    group: &Group,
    candidate: &EvalRow,
    finding: &Finding,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO anomalies
            (tenant_id, anomaly_id, evaluation_id, workflow_id, agent_id, agent_version,
             metric_name, method, metric_value, threshold_low, threshold_high, z_score, details)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(tenant_id)
    .bind(Uuid::new_v4())
    .bind(candidate.evaluation_id)
    .bind(&group.workflow_id)
    .bind(&group.agent_id)
    .bind(&group.agent_version)
    .bind(finding.metric_name)
    .bind(finding.method)
    .bind(finding.metric_value)
    .bind(finding.threshold_low)
    .bind(finding.threshold_high)
    .bind(finding.z_score)
    .bind(&finding.details)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE evaluation_records SET anomaly_flag = TRUE
         WHERE tenant_id = $1 AND evaluation_id = $2",
    )
    .bind(tenant_id)
    .bind(candidate.evaluation_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        tenant = %tenant_id,
        workflow = %group.workflow_id,
        agent = %group.agent_id,
        metric = finding.metric_name,
        method = finding.method,
        scored_at = %candidate.scoring_timestamp,
        "Recorded anomaly"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(latency: f64, faithfulness: Option<f64>, confidence: Option<f64>) -> EvalRow {
        EvalRow {
            evaluation_id: Uuid::new_v4(),
            latency_ms: latency,
            faithfulness,
            confidence,
            hallucination_flag: Some(false),
            anomaly_flag: false,
            scoring_timestamp: Utc::now(),
        }
    }

    fn steady_history(n: usize) -> Vec<EvalRow> {
        (0..n)
            .map(|i| {
                row(
                    1_000.0 + (i % 7) as f64 * 50.0,
                    Some(0.9 + 0.001 * (i % 5) as f64),
                    Some(0.8 + 0.002 * (i % 5) as f64),
                )
            })
            .collect()
    }

    #[test]
    fn hallucination_rule_ignores_history() {
        let mut candidate = row(100.0, Some(0.9), None);
        candidate.hallucination_flag = Some(true);
        let finding = examine(&candidate, &[], 30).expect("rule fires");
        assert_eq!(finding.method, "rule");
        assert_eq!(finding.metric_name, "hallucination_flag");
    }

    #[test]
    fn latency_spike_flagged_by_mad() {
        let history = steady_history(60);
        let candidate = row(25_000.0, Some(0.9), None);
        let finding = examine(&candidate, &history, 30).expect("mad fires");
        assert_eq!(finding.method, "mad");
        assert_eq!(finding.metric_name, "latency_ms");
        assert!(finding.z_score.unwrap().abs() > 3.5);
    }

    #[test]
    fn low_faithfulness_flagged_only_on_low_tail() {
        // Constant latency, varied faithfulness so the stddev is nonzero.
        let history: Vec<EvalRow> = (0..60)
            .map(|i| row(1_000.0, Some(0.9 + 0.004 * (i % 10) as f64), None))
            .collect();
        let low = row(1_000.0, Some(0.2), None);
        let finding = examine(&low, &history, 30).expect("low tail fires");
        assert_eq!(finding.metric_name, "faithfulness");
        assert!(finding.z_score.unwrap() < -3.0);

        // A suspiciously high value is not an anomaly for faithfulness.
        let high = row(1_000.0, Some(1.0), None);
        assert!(examine(&high, &history, 30).is_none());
    }

    #[test]
    fn confidence_check_runs_before_faithfulness() {
        let history = steady_history(60);
        let candidate = row(1_050.0, Some(0.901), Some(0.05));
        let finding = examine(&candidate, &history, 30).expect("confidence fires");
        assert_eq!(finding.metric_name, "confidence");
        assert_eq!(finding.method, "zscore");
    }

    #[test]
    fn insufficient_history_is_quiet() {
        let history = steady_history(10);
        let candidate = row(25_000.0, Some(0.2), Some(0.05));
        assert!(examine(&candidate, &history, 30).is_none());
    }

    #[test]
    fn normal_rows_pass_clean() {
        let history = steady_history(60);
        let candidate = row(1_100.0, Some(0.902), Some(0.805));
        assert!(examine(&candidate, &history, 30).is_none());
    }
}
