//! Distributional drift detection (the auto-eval job).
//!
//! Compares each group's recent faithfulness distribution against its own
//! baseline window using PSI and the 1D Wasserstein distance, maps PSI onto a
//! severity, and routes mitigations through the action store.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::{active_groups, Group};
use crate::actions::{ActionStore, ActionType};
use crate::config::Config;
use crate::stats;

const PSI_BINS: usize = 10;
const MIN_BASELINE_SAMPLES: usize = 20;
const MIN_CURRENT_SAMPLES: usize = 10;
const PSI_MODERATE: f64 = 0.2;
const PSI_SEVERE: f64 = 0.35;
const SAMPLING_RATE_MODERATE: f64 = 0.05;
const SAMPLING_RATE_SEVERE: f64 = 0.2;
const DECIDED_BY: &str = "job:auto-eval";
const SEVERE_REASON: &str = "severe_metric_drift";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    None,
    Moderate,
    Severe,
}

impl Severity {
    pub fn from_psi(psi: f64) -> Self {
        if psi >= PSI_SEVERE {
            Severity::Severe
        } else if psi >= PSI_MODERATE {
            Severity::Moderate
        } else {
            Severity::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
        }
    }
}

pub async fn run(pool: &PgPool, config: &Config) -> anyhow::Result<()> {
    let tenant_id = &config.jobs.tenant_id;
    let now = Utc::now();
    let baseline_hours = config.jobs.baseline_hours;
    let current_hours = config.jobs.current_hours;

    let base_start = now - Duration::hours(baseline_hours + current_hours);
    let cur_start = now - Duration::hours(current_hours);

    let groups = active_groups(pool, tenant_id, baseline_hours + current_hours).await?;
    let store = ActionStore::new(pool.clone());
    let mut drifted = 0u64;

    for group in &groups {
        let base_vals =
            faithfulness_values(pool, tenant_id, group, base_start, cur_start).await?;
        let cur_vals = faithfulness_values(pool, tenant_id, group, cur_start, now).await?;
        if base_vals.len() < MIN_BASELINE_SAMPLES || cur_vals.len() < MIN_CURRENT_SAMPLES {
            debug!(
                workflow = %group.workflow_id,
                agent = %group.agent_id,
                baseline = base_vals.len(),
                current = cur_vals.len(),
                "Skipping group with insufficient drift samples"
            );
            continue;
        }

        let psi = stats::psi(&base_vals, &cur_vals, PSI_BINS);
        let wasserstein = stats::wasserstein_1d(&base_vals, &cur_vals);
        let severity = Severity::from_psi(psi);

        info!(
            tenant = %tenant_id,
            workflow = %group.workflow_id,
            agent = %group.agent_id,
            version = %group.agent_version,
            psi,
            wasserstein,
            severity = severity.as_str(),
            "Drift check"
        );

        if severity == Severity::None {
            continue;
        }
        drifted += 1;

        let target = json!({
            "workflow_id": group.workflow_id,
            "agent_id": group.agent_id,
            "agent_version": group.agent_version,
        });
        let sampling_rate = match severity {
            Severity::Moderate => SAMPLING_RATE_MODERATE,
            _ => SAMPLING_RATE_SEVERE,
        };

        store
            .propose(
                tenant_id,
                ActionType::IncreaseEvalSampling,
                target.clone(),
                json!({
                    "metric": "faithfulness",
                    "psi": psi,
                    "wasserstein": wasserstein,
                    "severity": severity.as_str(),
                    "sampling_rate_suggested": sampling_rate,
                }),
                DECIDED_BY,
            )
            .await?;

        if severity == Severity::Severe {
            let severe_payload = json!({
                "reason": SEVERE_REASON,
                "metric": "faithfulness",
                "psi": psi,
                "wasserstein": wasserstein,
            });
            store
                .propose(
                    tenant_id,
                    ActionType::RequireHumanReview,
                    target.clone(),
                    severe_payload.clone(),
                    DECIDED_BY,
                )
                .await?;
            store
                .propose(
                    tenant_id,
                    ActionType::RouteFallback,
                    target,
                    severe_payload,
                    DECIDED_BY,
                )
                .await?;
        }
    }

    info!(
        tenant = %tenant_id,
        groups = groups.len(),
        drifted,
        "Auto-eval drift job complete"
    );
    Ok(())
}

async fn faithfulness_values(
    pool: &PgPool,
    tenant_id: &str,
    group: &Group,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<f64>> {
    let rows = sqlx::query(
        r#"
        SELECT faithfulness
        FROM evaluation_records
        WHERE tenant_id = $1 AND workflow_id = $2 AND agent_id = $3 AND agent_version = $4
          AND scoring_timestamp >= $5 AND scoring_timestamp < $6
          AND faithfulness IS NOT NULL
        "#,
    )
    .bind(tenant_id)
    .bind(&group.workflow_id)
    .bind(&group.agent_id)
    .bind(&group.agent_version)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| r.get::<f64, _>("faithfulness")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::from_psi(0.0), Severity::None);
        assert_eq!(Severity::from_psi(0.19), Severity::None);
        assert_eq!(Severity::from_psi(0.2), Severity::Moderate);
        assert_eq!(Severity::from_psi(0.34), Severity::Moderate);
        assert_eq!(Severity::from_psi(0.35), Severity::Severe);
        assert_eq!(Severity::from_psi(2.0), Severity::Severe);
    }

    #[test]
    fn shifted_population_reaches_severe() {
        // Baseline near 0.85, current near 0.65: the kind of faithfulness
        // collapse the job must classify as severe.
        let base: Vec<f64> = (0..200)
            .map(|i| 0.85 + 0.05 * ((i % 21) as f64 - 10.0) / 10.0)
            .collect();
        let cur: Vec<f64> = (0..60)
            .map(|i| 0.65 + 0.06 * ((i % 13) as f64 - 6.0) / 6.0)
            .collect();
        let psi = stats::psi(&base, &cur, PSI_BINS);
        assert!(psi >= PSI_SEVERE, "psi {} should be severe", psi);
        assert_eq!(Severity::from_psi(psi), Severity::Severe);
        assert!(stats::wasserstein_1d(&base, &cur) > 0.1);
    }

    #[test]
    fn identical_population_is_none() {
        let base: Vec<f64> = (0..200).map(|i| 0.8 + 0.001 * (i % 50) as f64).collect();
        let psi = stats::psi(&base, &base, PSI_BINS);
        assert!(psi.abs() < 1e-6);
        assert_eq!(Severity::from_psi(psi), Severity::None);
    }
}
