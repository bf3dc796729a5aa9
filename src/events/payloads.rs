//! Typed payload structs for the seven event types.
//!
//! These are the post-validation shapes; the structural checks in
//! [`super::schema`] run first, so deserialization failures here indicate a
//! registry/struct mismatch rather than bad client input.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationStarted {
    pub orchestrator_name: Option<String>,
    pub orchestrator_version: Option<String>,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub query_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationCompleted {
    pub status: RunStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_latency_ms: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Agent identity block shared by AgentRunStarted and AgentRunCompleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentRef {
    pub agent_run_id: Uuid,
    pub agent_id: String,
    pub agent_version: String,
    pub model: Option<String>,
    pub config_hash: Option<String>,
    pub parent_agent_run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunMetrics {
    pub latency_ms: f64,
    pub faithfulness: Option<f64>,
    pub coverage: Option<f64>,
    pub confidence: Option<f64>,
    pub hallucination_flag: Option<bool>,
    pub evaluator_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunOutput {
    pub summary: Option<String>,
    pub uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentCompleted {
    pub agent: AgentRef,
    pub metrics: RunMetrics,
    pub output: Option<RunOutput>,
}

/// Reserved: accepted and acknowledged, not yet materialized.
#[derive(Debug, Clone)]
pub struct RetrievalContext {
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentRef {
    pub id: String,
    pub weight: Option<f64>,
}

/// Three-case signal value; `text` is carried but never backtested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalValue {
    Scalar { value: f64 },
    Vector { values: BTreeMap<String, f64> },
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalPayload {
    pub signal_id: Uuid,
    pub horizon: String,
    pub instrument_universe: Vec<InstrumentRef>,
    pub value: SignalValue,
    pub confidence: Option<f64>,
    pub constraints: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutcomePayload {
    pub dataset_version: String,
    pub instrument_id: String,
    pub asof_time: DateTime<Utc>,
    pub realized_return: f64,
    pub benchmark_return: Option<f64>,
}
