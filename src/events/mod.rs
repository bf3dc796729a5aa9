//! Telemetry event model: the v1 envelope, the seven event types, and the
//! schema registry that validates incoming JSON into typed events.

pub mod payloads;
pub mod schema;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrchestrationRunStarted,
    OrchestrationRunCompleted,
    AgentRunStarted,
    AgentRunCompleted,
    RetrievalContextAttached,
    SignalEmitted,
    MarketOutcomeIngested,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::OrchestrationRunStarted,
        EventKind::OrchestrationRunCompleted,
        EventKind::AgentRunStarted,
        EventKind::AgentRunCompleted,
        EventKind::RetrievalContextAttached,
        EventKind::SignalEmitted,
        EventKind::MarketOutcomeIngested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrchestrationRunStarted => "OrchestrationRunStarted",
            EventKind::OrchestrationRunCompleted => "OrchestrationRunCompleted",
            EventKind::AgentRunStarted => "AgentRunStarted",
            EventKind::AgentRunCompleted => "AgentRunCompleted",
            EventKind::RetrievalContextAttached => "RetrievalContextAttached",
            EventKind::SignalEmitted => "SignalEmitted",
            EventKind::MarketOutcomeIngested => "MarketOutcomeIngested",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

/// Fields shared by every v1 event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: String,
    pub event_id: Uuid,
    pub tenant_id: String,
    pub orchestration_run_id: String,
    pub workflow_id: String,
    pub query_id: String,
    pub request_timestamp: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
}

/// A validated v1 event: envelope plus the type-specific payload.
#[derive(Debug, Clone)]
pub struct EventV1 {
    pub envelope: Envelope,
    pub body: EventBody,
}

#[derive(Debug, Clone)]
pub enum EventBody {
    OrchestrationRunStarted(payloads::OrchestrationStarted),
    OrchestrationRunCompleted(payloads::OrchestrationCompleted),
    AgentRunStarted(payloads::AgentRef),
    AgentRunCompleted(payloads::AgentCompleted),
    RetrievalContextAttached(payloads::RetrievalContext),
    SignalEmitted(payloads::SignalPayload),
    MarketOutcomeIngested(payloads::OutcomePayload),
}

impl EventV1 {
    pub fn kind(&self) -> EventKind {
        match &self.body {
            EventBody::OrchestrationRunStarted(_) => EventKind::OrchestrationRunStarted,
            EventBody::OrchestrationRunCompleted(_) => EventKind::OrchestrationRunCompleted,
            EventBody::AgentRunStarted(_) => EventKind::AgentRunStarted,
            EventBody::AgentRunCompleted(_) => EventKind::AgentRunCompleted,
            EventBody::RetrievalContextAttached(_) => EventKind::RetrievalContextAttached,
            EventBody::SignalEmitted(_) => EventKind::SignalEmitted,
            EventBody::MarketOutcomeIngested(_) => EventKind::MarketOutcomeIngested,
        }
    }
}
