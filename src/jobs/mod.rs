//! Scheduled analysis jobs. Each is single-shot and safe to re-run: writes are
//! keyed upserts or dedup-guarded inserts, so a crashed job simply runs again.

pub mod anomaly;
pub mod backtest;
pub mod drift;
pub mod rollup;
pub mod significance;
pub mod slo;

use sqlx::{PgPool, Row};

/// One `(workflow, agent, version)` evaluation group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Group {
    pub workflow_id: String,
    pub agent_id: String,
    pub agent_version: String,
}

/// Groups with at least one evaluation inside the lookback window.
pub async fn active_groups(
    pool: &PgPool,
    tenant_id: &str,
    lookback_hours: i64,
) -> anyhow::Result<Vec<Group>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT workflow_id, agent_id, agent_version
        FROM evaluation_records
        WHERE tenant_id = $1
          AND scoring_timestamp >= now() - make_interval(hours => $2::int)
          AND workflow_id IS NOT NULL
          AND agent_id IS NOT NULL
          AND agent_version IS NOT NULL
        ORDER BY workflow_id, agent_id, agent_version
        "#,
    )
    .bind(tenant_id)
    .bind(lookback_hours as i32)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Group {
            workflow_id: row.get("workflow_id"),
            agent_id: row.get("agent_id"),
            agent_version: row.get("agent_version"),
        })
        .collect())
}

/// Map a configured metric name onto its evaluation-record column. Only
/// numeric columns are eligible; anything unknown falls back to faithfulness.
pub fn metric_column(name: &str) -> &'static str {
    match name {
        "faithfulness" => "faithfulness",
        "coverage" => "coverage",
        "confidence" => "confidence",
        "latency" | "latency_ms" => "latency_ms",
        "quality" | "run_quality_score" => "run_quality_score",
        "risk" | "risk_score" => "risk_score",
        _ => "faithfulness",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_column_whitelist() {
        assert_eq!(metric_column("faithfulness"), "faithfulness");
        assert_eq!(metric_column("latency"), "latency_ms");
        assert_eq!(metric_column("quality"), "run_quality_score");
        // Unknown names cannot reach arbitrary columns.
        assert_eq!(metric_column("payload"), "faithfulness");
        assert_eq!(metric_column("'; DROP TABLE x; --"), "faithfulness");
    }
}
