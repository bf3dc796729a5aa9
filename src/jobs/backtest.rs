//! Backtest runner: joins emitted signals with point-in-time market outcomes
//! and scores the signal stream.
//!
//! The point-in-time discipline is structural: outcomes are fetched only by
//! `(dataset_version, asof_time = signal.event_time + horizon)`, so nothing
//! outside the dataset snapshot (or after the target instant) can leak into a
//! result.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit;
use crate::config::Config;
use crate::events::payloads::{InstrumentRef, SignalValue};
use crate::stats;

const MIN_PRICED_INSTRUMENTS: usize = 2;

static HORIZON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\s*([dwmy])$").expect("horizon regex is valid")
});

/// Parse a horizon string (`"1d"`, `"2 w"`, `"1m"`, `"1y"`) into milliseconds.
pub fn parse_horizon_ms(horizon: &str) -> Option<i64> {
    let caps = HORIZON_RE.captures(horizon.trim())?;
    let count: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit_ms: i64 = match caps.get(2)?.as_str() {
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "m" => 30 * 86_400_000,
        "y" => 365 * 86_400_000,
        _ => return None,
    };
    count.checked_mul(unit_ms)
}

#[derive(Debug)]
struct SignalRow {
    signal_id: Uuid,
    event_time: DateTime<Utc>,
    universe: Vec<InstrumentRef>,
    value: SignalValue,
}

/// Per-instrument raw scores for one signal; `None` when the signal cannot be
/// scored (text value, empty or sub-minimum universe).
pub fn raw_scores(universe: &[InstrumentRef], value: &SignalValue) -> Option<Vec<(String, f64)>> {
    let scores: Vec<(String, f64)> = match value {
        SignalValue::Scalar { value } => universe
            .iter()
            .map(|inst| (inst.id.clone(), value * inst.weight.unwrap_or(1.0)))
            .collect(),
        SignalValue::Vector { values } => universe
            .iter()
            .filter_map(|inst| {
                values
                    .get(&inst.id)
                    .map(|v| (inst.id.clone(), v * inst.weight.unwrap_or(1.0)))
            })
            .collect(),
        SignalValue::Text { .. } => return None,
    };
    if scores.len() < MIN_PRICED_INSTRUMENTS {
        return None;
    }
    Some(scores)
}

/// L1-normalize raw scores into portfolio weights. `None` when the scores sum
/// to zero absolute mass.
pub fn portfolio_weights(scores: &[(String, f64)]) -> Option<Vec<(String, f64)>> {
    let l1: f64 = scores.iter().map(|(_, s)| s.abs()).sum();
    if l1 == 0.0 {
        return None;
    }
    Some(
        scores
            .iter()
            .map(|(id, s)| (id.clone(), s / l1))
            .collect(),
    )
}

pub async fn run(pool: &PgPool, config: &Config) -> anyhow::Result<()> {
    let tenant_id = &config.jobs.tenant_id;
    let horizon = &config.jobs.horizon;
    let dataset_version = &config.jobs.dataset_version;
    let now = Utc::now();
    let start = config.jobs.backtest_start.unwrap_or(now - Duration::days(30));
    let end = config.jobs.backtest_end.unwrap_or(now);
    let cost = config.jobs.cost_bps / 10_000.0;

    let Some(horizon_ms) = parse_horizon_ms(horizon) else {
        anyhow::bail!("invalid HORIZON '{}': expected e.g. 1d, 2w, 1m, 1y", horizon);
    };

    let signals = fetch_signals(pool, tenant_id, horizon, start, end).await?;
    info!(
        tenant = %tenant_id,
        dataset_version = %dataset_version,
        horizon = %horizon,
        signals = signals.len(),
        "Backtest started"
    );

    let mut net_returns = Vec::new();
    let mut excess_returns = Vec::new();
    let mut ics = Vec::new();
    let mut instrument_observations = 0u64;

    for signal in &signals {
        let Some(scores) = raw_scores(&signal.universe, &signal.value) else {
            debug!(signal_id = %signal.signal_id, "Signal not scoreable, skipping");
            continue;
        };
        let Some(weights) = portfolio_weights(&scores) else {
            debug!(signal_id = %signal.signal_id, "Zero-mass signal, skipping");
            continue;
        };

        let target_time = signal.event_time + Duration::milliseconds(horizon_ms);
        let instruments: Vec<String> = weights.iter().map(|(id, _)| id.clone()).collect();
        let outcomes =
            fetch_outcomes(pool, tenant_id, dataset_version, target_time, &instruments).await?;

        // Matched = instruments with a priced outcome at exactly the target
        // instant in this dataset snapshot. Weight, raw score, realized and
        // benchmark returns travel together per instrument.
        let matched: Vec<(f64, f64, f64, Option<f64>)> = weights
            .iter()
            .zip(scores.iter())
            .filter_map(|((id, w), (_, raw))| {
                outcomes
                    .get(id)
                    .map(|(realized, benchmark)| (*w, *raw, *realized, *benchmark))
            })
            .collect();
        if matched.len() < MIN_PRICED_INSTRUMENTS {
            debug!(
                signal_id = %signal.signal_id,
                matched = matched.len(),
                "Too few priced instruments, skipping"
            );
            continue;
        }

        let gross: f64 = matched.iter().map(|(w, _, realized, _)| w * realized).sum();
        let benchmarks: Vec<f64> = matched.iter().filter_map(|(_, _, _, b)| *b).collect();
        let benchmark = if benchmarks.is_empty() {
            0.0
        } else {
            stats::mean(&benchmarks)
        };
        let net = gross - cost;
        let excess = net - benchmark;

        let raws: Vec<f64> = matched.iter().map(|(_, raw, _, _)| *raw).collect();
        let realizeds: Vec<f64> = matched.iter().map(|(_, _, realized, _)| *realized).collect();
        let ic = stats::pearson(&raws, &realizeds);

        sqlx::query(
            r#"
            INSERT INTO signal_outcomes
                (tenant_id, signal_id, horizon, realized_return, benchmark_return, excess_return, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, signal_id, horizon) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(signal.signal_id)
        .bind(horizon)
        .bind(net)
        .bind(benchmark)
        .bind(excess)
        .bind(json!({
            "gross_return": gross,
            "ic": ic,
            "matched_instruments": matched.len(),
            "target_time": target_time.to_rfc3339(),
            "dataset_version": dataset_version,
        }))
        .execute(pool)
        .await?;

        net_returns.push(net);
        excess_returns.push(excess);
        ics.push(ic);
        instrument_observations += matched.len() as u64;
    }

    let hit_rate = if net_returns.is_empty() {
        0.0
    } else {
        net_returns.iter().filter(|r| **r > 0.0).count() as f64 / net_returns.len() as f64
    };
    let summary = json!({
        "signal_count": net_returns.len(),
        "instrument_observations": instrument_observations,
        "mean_return": stats::mean(&net_returns),
        "std_return": stats::sample_stddev(&net_returns),
        "sharpe": stats::sharpe(&net_returns, stats::DEFAULT_ANNUALIZATION),
        "mean_excess_return": stats::mean(&excess_returns),
        "excess_sharpe": stats::sharpe(&excess_returns, stats::DEFAULT_ANNUALIZATION),
        "mean_ic": stats::mean(&ics),
        "ic_t_stat": stats::t_stat_of_mean(&ics),
        "hit_rate": hit_rate,
        "cost_bps": config.jobs.cost_bps,
    });

    let backtest_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO backtest_runs
            (tenant_id, backtest_id, dataset_version, horizon, window_start, window_end,
             cost_bps, code_version, status, summary)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'completed', $9)
        "#,
    )
    .bind(tenant_id)
    .bind(backtest_id)
    .bind(dataset_version)
    .bind(horizon)
    .bind(start)
    .bind(end)
    .bind(config.jobs.cost_bps)
    .bind(&config.jobs.code_version)
    .bind(&summary)
    .execute(pool)
    .await?;

    info!(
        tenant = %tenant_id,
        backtest_id = %backtest_id,
        scored = net_returns.len(),
        "Backtest complete"
    );
    audit::record(
        pool,
        Some(tenant_id),
        "job:backtest",
        "backtest.completed",
        json!({"backtest_id": backtest_id, "summary": summary}),
    )
    .await;
    Ok(())
}

async fn fetch_signals(
    pool: &PgPool,
    tenant_id: &str,
    horizon: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<SignalRow>> {
    let rows = sqlx::query(
        r#"
        SELECT signal_id, event_time, instrument_universe, signal_value
        FROM signals
        WHERE tenant_id = $1 AND horizon = $2
          AND event_time >= $3 AND event_time < $4
        ORDER BY event_time
        "#,
    )
    .bind(tenant_id)
    .bind(horizon)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    let mut signals = Vec::with_capacity(rows.len());
    for row in rows {
        let signal_id: Uuid = row.get("signal_id");
        let universe: serde_json::Value = row.get("instrument_universe");
        let value: serde_json::Value = row.get("signal_value");
        let universe: Vec<InstrumentRef> = match serde_json::from_value(universe) {
            Ok(u) => u,
            Err(e) => {
                warn!(signal_id = %signal_id, "Unparseable instrument universe: {}", e);
                continue;
            }
        };
        let value: SignalValue = match serde_json::from_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(signal_id = %signal_id, "Unparseable signal value: {}", e);
                continue;
            }
        };
        signals.push(SignalRow {
            signal_id,
            event_time: row.get("event_time"),
            universe,
            value,
        });
    }
    Ok(signals)
}

/// Outcomes for the exact `(dataset_version, asof_time)` snapshot, keyed by
/// instrument: `(realized_return, benchmark_return)`.
async fn fetch_outcomes(
    pool: &PgPool,
    tenant_id: &str,
    dataset_version: &str,
    asof_time: DateTime<Utc>,
    instruments: &[String],
) -> anyhow::Result<HashMap<String, (f64, Option<f64>)>> {
    let rows = sqlx::query(
        r#"
        SELECT instrument_id, realized_return, benchmark_return
        FROM market_outcomes
        WHERE tenant_id = $1 AND dataset_version = $2 AND asof_time = $3
          AND instrument_id = ANY($4)
        "#,
    )
    .bind(tenant_id)
    .bind(dataset_version)
    .bind(asof_time)
    .bind(instruments)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get::<String, _>("instrument_id"),
                (
                    row.get::<f64, _>("realized_return"),
                    row.get::<Option<f64>, _>("benchmark_return"),
                ),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn universe(ids: &[&str]) -> Vec<InstrumentRef> {
        ids.iter()
            .map(|id| InstrumentRef {
                id: id.to_string(),
                weight: None,
            })
            .collect()
    }

    #[test]
    fn horizon_parsing() {
        assert_eq!(parse_horizon_ms("1d"), Some(86_400_000));
        assert_eq!(parse_horizon_ms("2 w"), Some(14 * 86_400_000));
        assert_eq!(parse_horizon_ms("1m"), Some(30 * 86_400_000));
        assert_eq!(parse_horizon_ms("3y"), Some(3 * 365 * 86_400_000));
        assert_eq!(parse_horizon_ms("1h"), None);
        assert_eq!(parse_horizon_ms("d"), None);
        assert_eq!(parse_horizon_ms(""), None);
        assert_eq!(parse_horizon_ms("1d tomorrow"), None);
    }

    #[test]
    fn scalar_scores_spread_across_universe() {
        let mut universe = universe(&["A", "B"]);
        universe[1].weight = Some(2.0);
        let scores = raw_scores(&universe, &SignalValue::Scalar { value: 0.5 }).unwrap();
        assert_eq!(scores, vec![("A".into(), 0.5), ("B".into(), 1.0)]);
    }

    #[test]
    fn vector_scores_drop_missing_instruments() {
        let universe = universe(&["A", "B", "C"]);
        let mut values = BTreeMap::new();
        values.insert("A".to_string(), 0.4);
        values.insert("C".to_string(), -0.6);
        let scores = raw_scores(&universe, &SignalValue::Vector { values }).unwrap();
        assert_eq!(scores, vec![("A".into(), 0.4), ("C".into(), -0.6)]);
    }

    #[test]
    fn text_and_thin_signals_are_skipped() {
        let two = universe(&["A", "B"]);
        assert!(raw_scores(&two, &SignalValue::Text { text: "bullish".into() }).is_none());

        let one = universe(&["A"]);
        assert!(raw_scores(&one, &SignalValue::Scalar { value: 1.0 }).is_none());

        // Vector covering only one universe member is below the minimum.
        let mut values = BTreeMap::new();
        values.insert("A".to_string(), 1.0);
        assert!(raw_scores(&two, &SignalValue::Vector { values }).is_none());
    }

    #[test]
    fn weights_are_l1_normalized() {
        let scores = vec![("A".to_string(), 0.6), ("B".to_string(), -0.2)];
        let weights = portfolio_weights(&scores).unwrap();
        assert!((weights[0].1 - 0.75).abs() < 1e-12);
        assert!((weights[1].1 + 0.25).abs() < 1e-12);
        let l1: f64 = weights.iter().map(|(_, w)| w.abs()).sum();
        assert!((l1 - 1.0).abs() < 1e-12);

        assert!(portfolio_weights(&[("A".to_string(), 0.0), ("B".to_string(), 0.0)]).is_none());
    }
}
