//! SLO evaluation: refresh the rollups, then hold every rollup row against the
//! workflow's thresholds and open an investigation per breach.

use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::actions::{ActionStore, ActionType};
use crate::config::{slo::Override, Config};

const DECIDED_BY: &str = "job:slo";
const DEFAULT_KEY: &str = "default";

#[derive(Debug)]
struct RollupRow {
    workflow_id: String,
    agent_id: String,
    agent_version: String,
    hour_bucket: chrono::DateTime<chrono::Utc>,
    run_count: i64,
    latency_p95: Option<f64>,
    faithfulness_p05: Option<f64>,
    quality_p05: Option<f64>,
    anomaly_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Violation {
    pub kind: &'static str,
    pub observed: f64,
    pub threshold: f64,
}

pub async fn run(pool: &PgPool, config: &Config) -> anyhow::Result<()> {
    let tenant_id = &config.jobs.tenant_id;

    // Fresh aggregates first; stale rollups make for phantom violations.
    super::rollup::materialize_rollups(pool, tenant_id, config.jobs.lookback_hours).await?;

    let default_slo = config.slo_overrides.get(DEFAULT_KEY).cloned().unwrap_or_default();
    let rows = fetch_rollups(pool, tenant_id, config.jobs.lookback_hours).await?;
    let store = ActionStore::new(pool.clone());
    let mut opened = 0u64;

    for row in &rows {
        let slo = config
            .slo_overrides
            .get(&row.workflow_id)
            .map(|specific| specific.merged_over(&default_slo))
            .unwrap_or_else(|| default_slo.clone());

        for violation in evaluate(row, &slo) {
            let target = json!({
                "workflow_id": row.workflow_id,
                "agent_id": row.agent_id,
                "agent_version": row.agent_version,
                "hour_bucket": row.hour_bucket.to_rfc3339(),
                "violation": violation.kind,
            });
            let created = store
                .propose(
                    tenant_id,
                    ActionType::RunInvestigation,
                    target,
                    json!({
                        "observed": violation.observed,
                        "threshold": violation.threshold,
                        "run_count": row.run_count,
                    }),
                    DECIDED_BY,
                )
                .await?;
            if created.is_some() {
                opened += 1;
            }
        }
    }

    if rows.is_empty() {
        debug!(tenant = %tenant_id, "No rollup rows inside the SLO window");
    }
    info!(tenant = %tenant_id, rollups = rows.len(), opened, "SLO job complete");
    Ok(())
}

/// All threshold breaches for one rollup row.
fn evaluate(row: &RollupRow, slo: &Override) -> Vec<Violation> {
    let mut violations = Vec::new();

    if let (Some(threshold), Some(observed)) = (slo.max_latency_p95_ms, row.latency_p95) {
        if observed > threshold {
            violations.push(Violation {
                kind: "latency_p95_exceeded",
                observed,
                threshold,
            });
        }
    }
    if let (Some(threshold), Some(observed)) = (slo.min_faithfulness_p05, row.faithfulness_p05) {
        if observed < threshold {
            violations.push(Violation {
                kind: "faithfulness_p05_below_min",
                observed,
                threshold,
            });
        }
    }
    if let (Some(threshold), Some(observed)) = (slo.min_quality_p05, row.quality_p05) {
        if observed < threshold {
            violations.push(Violation {
                kind: "quality_p05_below_min",
                observed,
                threshold,
            });
        }
    }
    if let Some(threshold) = slo.max_anomaly_rate {
        if row.run_count > 0 {
            let rate = row.anomaly_count as f64 / row.run_count as f64;
            if rate > threshold {
                violations.push(Violation {
                    kind: "anomaly_rate_exceeded",
                    observed: rate,
                    threshold,
                });
            }
        }
    }

    violations
}

async fn fetch_rollups(
    pool: &PgPool,
    tenant_id: &str,
    lookback_hours: i64,
) -> anyhow::Result<Vec<RollupRow>> {
    let rows = sqlx::query(
        r#"
        SELECT workflow_id, agent_id, agent_version, hour_bucket, run_count,
               latency_p95, faithfulness_p05, quality_p05, anomaly_count
        FROM metric_rollups_hourly
        WHERE tenant_id = $1
          AND hour_bucket >= now() - make_interval(hours => $2::int)
        ORDER BY hour_bucket
        "#,
    )
    .bind(tenant_id)
    .bind(lookback_hours as i32)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RollupRow {
            workflow_id: row.get("workflow_id"),
            agent_id: row.get("agent_id"),
            agent_version: row.get("agent_version"),
            hour_bucket: row.get("hour_bucket"),
            run_count: row.get("run_count"),
            latency_p95: row.get("latency_p95"),
            faithfulness_p05: row.get("faithfulness_p05"),
            quality_p05: row.get("quality_p05"),
            anomaly_count: row.get("anomaly_count"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rollup(latency_p95: f64, faithfulness_p05: f64, quality_p05: f64, anomalies: i64) -> RollupRow {
        RollupRow {
            workflow_id: "wf".into(),
            agent_id: "agent".into(),
            agent_version: "1".into(),
            hour_bucket: Utc::now(),
            run_count: 100,
            latency_p95: Some(latency_p95),
            faithfulness_p05: Some(faithfulness_p05),
            quality_p05: Some(quality_p05),
            anomaly_count: anomalies,
        }
    }

    fn strict_slo() -> Override {
        Override {
            max_latency_p95_ms: Some(2_000.0),
            min_faithfulness_p05: Some(0.7),
            min_quality_p05: Some(0.6),
            max_anomaly_rate: Some(0.05),
        }
    }

    #[test]
    fn clean_rollup_has_no_violations() {
        let row = rollup(1_500.0, 0.8, 0.7, 2);
        assert!(evaluate(&row, &strict_slo()).is_empty());
    }

    #[test]
    fn each_threshold_produces_its_kind() {
        let row = rollup(3_000.0, 0.5, 0.4, 20);
        let kinds: Vec<&str> = evaluate(&row, &strict_slo()).iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![
                "latency_p95_exceeded",
                "faithfulness_p05_below_min",
                "quality_p05_below_min",
                "anomaly_rate_exceeded"
            ]
        );
    }

    #[test]
    fn absent_thresholds_are_not_enforced() {
        let row = rollup(50_000.0, 0.0, 0.0, 100);
        assert!(evaluate(&row, &Override::default()).is_empty());
    }

    #[test]
    fn anomaly_rate_uses_run_count() {
        let mut row = rollup(100.0, 0.9, 0.9, 6);
        // 6 / 100 > 0.05.
        let violations = evaluate(&row, &strict_slo());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, "anomaly_rate_exceeded");
        assert!((violations[0].observed - 0.06).abs() < 1e-12);

        row.run_count = 0;
        assert!(evaluate(&row, &strict_slo()).is_empty());
    }
}
