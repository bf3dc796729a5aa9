use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Process configuration, loaded from the environment.
///
/// Every knob has a default except `DATABASE_URL`. Per-workflow overrides
/// (normalization, SLO thresholds) arrive as JSON blobs so that a deployment
/// can tune workflows without a schema change.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// API keys for the ingest/query endpoints. Empty = auth disabled.
    pub api_keys: Vec<String>,
    pub pg_pool_max: u32,
    pub pg_connect_timeout_ms: u64,
    pub pg_idle_timeout_ms: u64,
    pub pg_ssl: bool,
    pub max_body_bytes: usize,
    pub worker: WorkerConfig,
    pub jobs: JobsConfig,
    /// JSON map: workflow_id -> partial normalization config.
    pub workflow_overrides: HashMap<String, normalization::Override>,
    /// JSON map: workflow_id -> partial SLO config, plus a "default" entry.
    pub slo_overrides: HashMap<String, slo::Override>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: i64,
    pub max_attempts: i32,
    pub idle_sleep_ms: u64,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub tenant_id: String,
    pub lookback_hours: i64,
    pub min_history: usize,
    pub per_group_limit: i64,
    pub window_hours: i64,
    pub significance_metric: String,
    pub alpha: f64,
    pub baseline_hours: i64,
    pub current_hours: i64,
    pub horizon: String,
    pub dataset_version: String,
    pub cost_bps: f64,
    pub code_version: String,
    pub backtest_start: Option<DateTime<Utc>>,
    pub backtest_end: Option<DateTime<Utc>>,
}

pub mod normalization {
    use super::Deserialize;

    /// Partial per-workflow normalization config; merged shallowly onto the
    /// global defaults by `normalize::resolve_config`.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct Override {
        pub latency_p99_target_ms: Option<f64>,
        #[serde(default)]
        pub quality_weights: WeightsOverride,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct WeightsOverride {
        pub faithfulness: Option<f64>,
        pub coverage: Option<f64>,
        pub confidence: Option<f64>,
        pub hallucination: Option<f64>,
        pub latency: Option<f64>,
    }
}

pub mod slo {
    use super::Deserialize;

    /// Partial per-workflow SLO thresholds. Absent fields mean "not enforced"
    /// unless the "default" entry supplies them.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct Override {
        pub max_latency_p95_ms: Option<f64>,
        pub min_faithfulness_p05: Option<f64>,
        pub min_quality_p05: Option<f64>,
        pub max_anomaly_rate: Option<f64>,
    }

    impl Override {
        pub fn merged_over(&self, base: &Override) -> Override {
            Override {
                max_latency_p95_ms: self.max_latency_p95_ms.or(base.max_latency_p95_ms),
                min_faithfulness_p05: self.min_faithfulness_p05.or(base.min_faithfulness_p05),
                min_quality_p05: self.min_quality_p05.or(base.min_quality_p05),
                max_anomaly_rate: self.max_anomaly_rate.or(base.max_anomaly_rate),
            }
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;

        Ok(Self {
            database_url,
            host: env_or("HOST", default_host),
            port: env_parse("PORT", default_port)?,
            api_keys: parse_api_keys(&std::env::var("EVAL_API_KEYS").unwrap_or_default()),
            pg_pool_max: env_parse("PG_POOL_MAX", default_pg_pool_max)?,
            pg_connect_timeout_ms: env_parse("PG_CONNECT_TIMEOUT_MS", default_pg_connect_timeout_ms)?,
            pg_idle_timeout_ms: env_parse("PG_IDLE_TIMEOUT_MS", default_pg_idle_timeout_ms)?,
            pg_ssl: env_parse("PG_SSL", || false)?,
            max_body_bytes: env_parse("MAX_BODY_BYTES", default_max_body_bytes)?,
            worker: WorkerConfig {
                batch_size: env_parse("WORKER_BATCH_SIZE", default_worker_batch_size)?,
                max_attempts: env_parse("WORKER_MAX_ATTEMPTS", default_worker_max_attempts)?,
                idle_sleep_ms: env_parse("WORKER_IDLE_SLEEP_MS", default_worker_idle_sleep_ms)?,
            },
            jobs: JobsConfig {
                tenant_id: env_or("TENANT_ID", default_tenant),
                lookback_hours: env_parse("LOOKBACK_HOURS", default_lookback_hours)?,
                min_history: env_parse("MIN_HISTORY", default_min_history)?,
                per_group_limit: env_parse("PER_GROUP_LIMIT", default_per_group_limit)?,
                window_hours: env_parse("WINDOW_HOURS", default_window_hours)?,
                significance_metric: env_or("SIGNIFICANCE_METRIC", default_significance_metric),
                alpha: env_parse("ALPHA", default_alpha)?,
                baseline_hours: env_parse("BASELINE_HOURS", default_baseline_hours)?,
                current_hours: env_parse("CURRENT_HOURS", default_current_hours)?,
                horizon: env_or("HORIZON", default_horizon),
                dataset_version: env_or("DATASET_VERSION", default_dataset_version),
                cost_bps: env_parse("COST_BPS", || 0.0)?,
                code_version: env_or("CODE_VERSION", default_code_version),
                backtest_start: env_instant("BACKTEST_START")?,
                backtest_end: env_instant("BACKTEST_END")?,
            },
            workflow_overrides: env_json_map("WORKFLOW_CONFIG_JSON")?,
            slo_overrides: env_json_map("SLO_CONFIG_JSON")?,
        })
    }
}

fn env_or(key: &str, default: fn() -> String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: fn() -> T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e)),
        _ => Ok(default()),
    }
}

fn env_instant(key: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => DateTime::parse_from_rfc3339(v.trim())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e)),
        _ => Ok(None),
    }
}

fn env_json_map<T: serde::de::DeserializeOwned>(key: &str) -> anyhow::Result<HashMap<String, T>> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => {
            serde_json::from_str(&v).map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e))
        }
        _ => Ok(HashMap::new()),
    }
}

fn parse_api_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_pg_pool_max() -> u32 {
    10
}
fn default_pg_connect_timeout_ms() -> u64 {
    5_000
}
fn default_pg_idle_timeout_ms() -> u64 {
    300_000
}
fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_worker_batch_size() -> i64 {
    100
}
fn default_worker_max_attempts() -> i32 {
    5
}
fn default_worker_idle_sleep_ms() -> u64 {
    500
}
fn default_tenant() -> String {
    "default".to_string()
}
fn default_lookback_hours() -> i64 {
    24
}
fn default_min_history() -> usize {
    30
}
fn default_per_group_limit() -> i64 {
    500
}
fn default_window_hours() -> i64 {
    1
}
fn default_significance_metric() -> String {
    "faithfulness".to_string()
}
fn default_alpha() -> f64 {
    0.05
}
fn default_baseline_hours() -> i64 {
    72
}
fn default_current_hours() -> i64 {
    6
}
fn default_horizon() -> String {
    "1d".to_string()
}
fn default_dataset_version() -> String {
    "v1".to_string()
}
fn default_code_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_split_and_trim() {
        assert_eq!(parse_api_keys(""), Vec::<String>::new());
        assert_eq!(parse_api_keys("a, b ,,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn slo_override_merge_prefers_specific() {
        let base = slo::Override {
            max_latency_p95_ms: Some(2_000.0),
            min_faithfulness_p05: Some(0.6),
            min_quality_p05: None,
            max_anomaly_rate: Some(0.05),
        };
        let specific = slo::Override {
            max_latency_p95_ms: Some(500.0),
            ..Default::default()
        };
        let merged = specific.merged_over(&base);
        assert_eq!(merged.max_latency_p95_ms, Some(500.0));
        assert_eq!(merged.min_faithfulness_p05, Some(0.6));
        assert_eq!(merged.min_quality_p05, None);
        assert_eq!(merged.max_anomaly_rate, Some(0.05));
    }
}
