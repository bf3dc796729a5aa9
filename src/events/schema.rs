//! Declarative schema registry for v1 events.
//!
//! Validation is structural and total: every problem in a submitted document
//! is reported as a `{path, keyword, params, message}` record, and unknown
//! fields are rejected at every level. Only a document that validates cleanly
//! is handed to the typed deserializers in [`super::payloads`].

use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::payloads::{
    AgentCompleted, AgentRef, OrchestrationCompleted, OrchestrationStarted, OutcomePayload,
    RetrievalContext, RunMetrics, RunOutput, SignalPayload,
};
use super::{Envelope, EventBody, EventKind, EventV1, SCHEMA_VERSION};

#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub path: String,
    pub keyword: String,
    pub params: Value,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, keyword: &str, params: Value, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            keyword: keyword.to_string(),
            params,
            message: message.into(),
        }
    }

    fn prefixed(mut self, prefix: &str) -> Self {
        self.path = format!("{}{}", prefix, self.path);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldKind {
    Str,
    Uuid,
    Timestamp,
    Number,
    Integer,
    Bool,
    Object,
    Array,
}

impl FieldKind {
    fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Str | FieldKind::Uuid | FieldKind::Timestamp => "string",
            FieldKind::Number | FieldKind::Integer => "number",
            FieldKind::Bool => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    required: bool,
    kind: FieldKind,
}

const fn req(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        required: true,
        kind,
    }
}

const fn opt(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        required: false,
        kind,
    }
}

const ENVELOPE_FIELDS: &[FieldSpec] = &[
    req("schema_version", FieldKind::Str),
    req("event_id", FieldKind::Uuid),
    req("tenant_id", FieldKind::Str),
    req("orchestration_run_id", FieldKind::Str),
    req("workflow_id", FieldKind::Str),
    req("query_id", FieldKind::Str),
    req("request_timestamp", FieldKind::Timestamp),
    req("event_time", FieldKind::Timestamp),
];

const AGENT_FIELDS: &[FieldSpec] = &[
    req("agent_run_id", FieldKind::Uuid),
    req("agent_id", FieldKind::Str),
    req("agent_version", FieldKind::Str),
    opt("model", FieldKind::Str),
    opt("config_hash", FieldKind::Str),
    opt("parent_agent_run_id", FieldKind::Uuid),
    opt("started_at", FieldKind::Timestamp),
];

const METRIC_FIELDS: &[FieldSpec] = &[
    req("latency_ms", FieldKind::Number),
    opt("faithfulness", FieldKind::Number),
    opt("coverage", FieldKind::Number),
    opt("confidence", FieldKind::Number),
    opt("hallucination_flag", FieldKind::Bool),
    opt("evaluator_version", FieldKind::Str),
];

const OUTPUT_FIELDS: &[FieldSpec] = &[opt("summary", FieldKind::Str), opt("uri", FieldKind::Str)];

const ORCHESTRATION_FIELDS: &[FieldSpec] = &[
    opt("orchestrator_name", FieldKind::Str),
    opt("orchestrator_version", FieldKind::Str),
    opt("client_id", FieldKind::Str),
    opt("user_id", FieldKind::Str),
    opt("query_text", FieldKind::Str),
];

const RESULT_FIELDS: &[FieldSpec] = &[
    req("status", FieldKind::Str),
    opt("completed_at", FieldKind::Timestamp),
    opt("total_latency_ms", FieldKind::Integer),
    opt("error_code", FieldKind::Str),
    opt("error_message", FieldKind::Str),
];

const OUTCOME_FIELDS: &[FieldSpec] = &[
    req("dataset_version", FieldKind::Str),
    req("instrument_id", FieldKind::Str),
    req("asof_time", FieldKind::Timestamp),
    req("realized_return", FieldKind::Number),
    opt("benchmark_return", FieldKind::Number),
];

const SIGNAL_FIELDS: &[FieldSpec] = &[
    req("signal_id", FieldKind::Uuid),
    req("horizon", FieldKind::Str),
    req("instrument_universe", FieldKind::Array),
    req("value", FieldKind::Object),
    opt("confidence", FieldKind::Number),
    opt("constraints", FieldKind::Object),
];

/// A type-specific sub-object slot. `fields: None` means the interior is
/// opaque (validated as an object, contents accepted as-is).
struct SubObject {
    name: &'static str,
    required: bool,
    fields: Option<&'static [FieldSpec]>,
}

fn sub_objects(kind: EventKind) -> &'static [SubObject] {
    match kind {
        EventKind::OrchestrationRunStarted => &[SubObject {
            name: "orchestration",
            required: true,
            fields: Some(ORCHESTRATION_FIELDS),
        }],
        EventKind::OrchestrationRunCompleted => &[SubObject {
            name: "result",
            required: true,
            fields: Some(RESULT_FIELDS),
        }],
        EventKind::AgentRunStarted => &[SubObject {
            name: "agent",
            required: true,
            fields: Some(AGENT_FIELDS),
        }],
        EventKind::AgentRunCompleted => &[
            SubObject {
                name: "agent",
                required: true,
                fields: Some(AGENT_FIELDS),
            },
            SubObject {
                name: "metrics",
                required: true,
                fields: Some(METRIC_FIELDS),
            },
            SubObject {
                name: "output",
                required: false,
                fields: Some(OUTPUT_FIELDS),
            },
        ],
        EventKind::RetrievalContextAttached => &[SubObject {
            name: "context",
            required: true,
            fields: None,
        }],
        EventKind::SignalEmitted => &[SubObject {
            name: "signal",
            required: true,
            fields: Some(SIGNAL_FIELDS),
        }],
        EventKind::MarketOutcomeIngested => &[SubObject {
            name: "outcome",
            required: true,
            fields: Some(OUTCOME_FIELDS),
        }],
    }
}

fn check_kind(path: &str, value: &Value, kind: FieldKind, errors: &mut Vec<ValidationError>) {
    let ok = match kind {
        FieldKind::Str => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Bool => value.is_boolean(),
        FieldKind::Object => value.is_object(),
        FieldKind::Array => value.is_array(),
        FieldKind::Uuid | FieldKind::Timestamp => value.is_string(),
    };
    if !ok {
        errors.push(ValidationError::new(
            path,
            "type",
            json!({"type": kind.type_name()}),
            format!("must be {}", kind.type_name()),
        ));
        return;
    }
    match kind {
        FieldKind::Uuid => {
            let s = value.as_str().unwrap_or_default();
            if Uuid::parse_str(s).is_err() {
                errors.push(ValidationError::new(
                    path,
                    "format",
                    json!({"format": "uuid"}),
                    "must be a UUID",
                ));
            }
        }
        FieldKind::Timestamp => {
            let s = value.as_str().unwrap_or_default();
            if chrono::DateTime::parse_from_rfc3339(s).is_err() {
                errors.push(ValidationError::new(
                    path,
                    "format",
                    json!({"format": "date-time"}),
                    "must be an RFC 3339 instant",
                ));
            }
        }
        _ => {}
    }
}

fn check_fields(
    path: &str,
    obj: &Map<String, Value>,
    specs: &[FieldSpec],
    errors: &mut Vec<ValidationError>,
) {
    for spec in specs {
        match obj.get(spec.name) {
            Some(Value::Null) if !spec.required => {}
            Some(value) => {
                check_kind(&format!("{}/{}", path, spec.name), value, spec.kind, errors)
            }
            None if spec.required => errors.push(ValidationError::new(
                path,
                "required",
                json!({"missingProperty": spec.name}),
                format!("missing required property '{}'", spec.name),
            )),
            None => {}
        }
    }
    for key in obj.keys() {
        if !specs.iter().any(|s| s.name == key) {
            errors.push(ValidationError::new(
                format!("{}/{}", path, key),
                "additionalProperties",
                json!({"additionalProperty": key}),
                "unknown property",
            ));
        }
    }
}

fn check_signal_extras(path: &str, obj: &Map<String, Value>, errors: &mut Vec<ValidationError>) {
    if let Some(Value::Array(items)) = obj.get("instrument_universe") {
        if items.is_empty() {
            errors.push(ValidationError::new(
                format!("{}/instrument_universe", path),
                "minItems",
                json!({"limit": 1}),
                "must list at least one instrument",
            ));
        }
        for (i, item) in items.iter().enumerate() {
            let item_path = format!("{}/instrument_universe/{}", path, i);
            match item.as_object() {
                Some(entry) => check_fields(
                    &item_path,
                    entry,
                    &[req("id", FieldKind::Str), opt("weight", FieldKind::Number)],
                    errors,
                ),
                None => errors.push(ValidationError::new(
                    item_path,
                    "type",
                    json!({"type": "object"}),
                    "must be object",
                )),
            }
        }
    }

    if let Some(Value::Object(value_obj)) = obj.get("value") {
        let value_path = format!("{}/value", path);
        match value_obj.get("kind").and_then(Value::as_str) {
            Some("scalar") => check_fields(
                &value_path,
                value_obj,
                &[req("kind", FieldKind::Str), req("value", FieldKind::Number)],
                errors,
            ),
            Some("vector") => {
                check_fields(
                    &value_path,
                    value_obj,
                    &[req("kind", FieldKind::Str), req("values", FieldKind::Object)],
                    errors,
                );
                if let Some(Value::Object(values)) = value_obj.get("values") {
                    for (instrument, v) in values {
                        if !v.is_number() {
                            errors.push(ValidationError::new(
                                format!("{}/values/{}", value_path, instrument),
                                "type",
                                json!({"type": "number"}),
                                "must be number",
                            ));
                        }
                    }
                }
            }
            Some("text") => check_fields(
                &value_path,
                value_obj,
                &[req("kind", FieldKind::Str), req("text", FieldKind::Str)],
                errors,
            ),
            Some(other) => errors.push(ValidationError::new(
                format!("{}/kind", value_path),
                "enum",
                json!({"allowedValues": ["scalar", "vector", "text"]}),
                format!("unknown signal value kind '{}'", other),
            )),
            None => errors.push(ValidationError::new(
                value_path,
                "required",
                json!({"missingProperty": "kind"}),
                "missing required property 'kind'",
            )),
        }
    }
}

/// Validate one event document against the registry.
pub fn validate_event(value: &Value) -> Result<EventV1, Vec<ValidationError>> {
    let Some(obj) = value.as_object() else {
        return Err(vec![ValidationError::new(
            "",
            "type",
            json!({"type": "object"}),
            "event must be an object",
        )]);
    };

    let kind = match obj.get("type") {
        Some(Value::String(s)) => match EventKind::from_str(s) {
            Some(kind) => kind,
            None => {
                return Err(vec![ValidationError::new(
                    "/type",
                    "enum",
                    json!({"allowedValues": EventKind::ALL.map(|k| k.as_str())}),
                    format!("unknown event type '{}'", s),
                )]);
            }
        },
        Some(_) => {
            return Err(vec![ValidationError::new(
                "/type",
                "type",
                json!({"type": "string"}),
                "must be string",
            )]);
        }
        None => {
            return Err(vec![ValidationError::new(
                "",
                "required",
                json!({"missingProperty": "type"}),
                "missing required property 'type'",
            )]);
        }
    };

    let mut errors = Vec::new();

    if let Some(Value::String(v)) = obj.get("schema_version") {
        if v != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "/schema_version",
                "const",
                json!({"allowedValue": SCHEMA_VERSION}),
                format!("must equal '{}'", SCHEMA_VERSION),
            ));
        }
    }
    for spec in ENVELOPE_FIELDS {
        match obj.get(spec.name) {
            Some(value) => check_kind(&format!("/{}", spec.name), value, spec.kind, &mut errors),
            None => errors.push(ValidationError::new(
                "",
                "required",
                json!({"missingProperty": spec.name}),
                format!("missing required property '{}'", spec.name),
            )),
        }
    }

    let subs = sub_objects(kind);
    for sub in subs {
        let sub_path = format!("/{}", sub.name);
        match obj.get(sub.name) {
            Some(Value::Object(sub_obj)) => {
                if let Some(fields) = sub.fields {
                    check_fields(&sub_path, sub_obj, fields, &mut errors);
                }
                if kind == EventKind::SignalEmitted && sub.name == "signal" {
                    check_signal_extras(&sub_path, sub_obj, &mut errors);
                }
                if kind == EventKind::OrchestrationRunCompleted && sub.name == "result" {
                    if let Some(Value::String(status)) = sub_obj.get("status") {
                        if status != "success" && status != "error" {
                            errors.push(ValidationError::new(
                                "/result/status",
                                "enum",
                                json!({"allowedValues": ["success", "error"]}),
                                format!("unknown status '{}'", status),
                            ));
                        }
                    }
                }
            }
            Some(_) => errors.push(ValidationError::new(
                sub_path,
                "type",
                json!({"type": "object"}),
                "must be object",
            )),
            None if sub.required => errors.push(ValidationError::new(
                "",
                "required",
                json!({"missingProperty": sub.name}),
                format!("missing required property '{}'", sub.name),
            )),
            None => {}
        }
    }

    // Unknown top-level properties.
    for key in obj.keys() {
        let known = key == "type"
            || ENVELOPE_FIELDS.iter().any(|s| s.name == key)
            || subs.iter().any(|s| s.name == key);
        if !known {
            errors.push(ValidationError::new(
                format!("/{}", key),
                "additionalProperties",
                json!({"additionalProperty": key}),
                "unknown property",
            ));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    parse_typed(kind, obj).map_err(|e| {
        vec![ValidationError::new(
            "",
            "schema",
            json!({}),
            format!("payload deserialization failed: {}", e),
        )]
    })
}

/// Validate a batch body: either `{schema_version: "v1", events: [...]}` or a
/// bare array of events.
pub fn validate_batch(value: &Value) -> Result<Vec<EventV1>, Vec<ValidationError>> {
    let items: &Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(obj) => {
            let mut errors = Vec::new();
            match obj.get("schema_version") {
                Some(Value::String(v)) if v == SCHEMA_VERSION => {}
                Some(_) => errors.push(ValidationError::new(
                    "/schema_version",
                    "const",
                    json!({"allowedValue": SCHEMA_VERSION}),
                    format!("must equal '{}'", SCHEMA_VERSION),
                )),
                None => errors.push(ValidationError::new(
                    "",
                    "required",
                    json!({"missingProperty": "schema_version"}),
                    "missing required property 'schema_version'",
                )),
            }
            for key in obj.keys() {
                if key != "schema_version" && key != "events" {
                    errors.push(ValidationError::new(
                        format!("/{}", key),
                        "additionalProperties",
                        json!({"additionalProperty": key}),
                        "unknown property",
                    ));
                }
            }
            match obj.get("events") {
                Some(Value::Array(items)) => {
                    if !errors.is_empty() {
                        return Err(errors);
                    }
                    items
                }
                Some(_) => {
                    errors.push(ValidationError::new(
                        "/events",
                        "type",
                        json!({"type": "array"}),
                        "must be array",
                    ));
                    return Err(errors);
                }
                None => {
                    errors.push(ValidationError::new(
                        "",
                        "required",
                        json!({"missingProperty": "events"}),
                        "missing required property 'events'",
                    ));
                    return Err(errors);
                }
            }
        }
        _ => {
            return Err(vec![ValidationError::new(
                "",
                "type",
                json!({"type": "array"}),
                "batch must be an array or a v1 envelope object",
            )]);
        }
    };

    let mut events = Vec::with_capacity(items.len());
    let mut errors = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match validate_event(item) {
            Ok(event) => events.push(event),
            Err(item_errors) => {
                let prefix = format!("/events/{}", i);
                errors.extend(item_errors.into_iter().map(|e| e.prefixed(&prefix)));
            }
        }
    }
    if errors.is_empty() {
        Ok(events)
    } else {
        Err(errors)
    }
}

fn parse_typed(kind: EventKind, obj: &Map<String, Value>) -> anyhow::Result<EventV1> {
    let mut envelope_map = Map::new();
    for spec in ENVELOPE_FIELDS {
        if let Some(v) = obj.get(spec.name) {
            envelope_map.insert(spec.name.to_string(), v.clone());
        }
    }
    let envelope: Envelope = serde_json::from_value(Value::Object(envelope_map))?;

    let sub = |name: &str| -> Value { obj.get(name).cloned().unwrap_or(Value::Null) };

    let body = match kind {
        EventKind::OrchestrationRunStarted => EventBody::OrchestrationRunStarted(
            serde_json::from_value::<OrchestrationStarted>(sub("orchestration"))?,
        ),
        EventKind::OrchestrationRunCompleted => EventBody::OrchestrationRunCompleted(
            serde_json::from_value::<OrchestrationCompleted>(sub("result"))?,
        ),
        EventKind::AgentRunStarted => {
            EventBody::AgentRunStarted(serde_json::from_value::<AgentRef>(sub("agent"))?)
        }
        EventKind::AgentRunCompleted => EventBody::AgentRunCompleted(AgentCompleted {
            agent: serde_json::from_value::<AgentRef>(sub("agent"))?,
            metrics: serde_json::from_value::<RunMetrics>(sub("metrics"))?,
            output: match obj.get("output") {
                Some(v) if !v.is_null() => Some(serde_json::from_value::<RunOutput>(v.clone())?),
                _ => None,
            },
        }),
        EventKind::RetrievalContextAttached => {
            EventBody::RetrievalContextAttached(RetrievalContext {
                context: sub("context"),
            })
        }
        EventKind::SignalEmitted => {
            EventBody::SignalEmitted(serde_json::from_value::<SignalPayload>(sub("signal"))?)
        }
        EventKind::MarketOutcomeIngested => {
            EventBody::MarketOutcomeIngested(serde_json::from_value::<OutcomePayload>(sub("outcome"))?)
        }
    };

    Ok(EventV1 { envelope, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_event(kind: &str) -> Value {
        json!({
            "schema_version": "v1",
            "type": kind,
            "event_id": "7b7e3f5e-32a5-4cf2-9d34-0d0a2c0c8f11",
            "tenant_id": "acme",
            "orchestration_run_id": "run-1",
            "workflow_id": "wf-research",
            "query_id": "q-1",
            "request_timestamp": "2025-06-01T10:00:00Z",
            "event_time": "2025-06-01T10:00:01Z"
        })
    }

    fn agent_completed() -> Value {
        let mut event = base_event("AgentRunCompleted");
        event["agent"] = json!({
            "agent_run_id": "3f4f6f0a-9a41-4c90-8f6b-2a3e38f0a001",
            "agent_id": "summarizer",
            "agent_version": "2.3.1"
        });
        event["metrics"] = json!({
            "latency_ms": 1200.0,
            "faithfulness": 0.93,
            "hallucination_flag": false
        });
        event
    }

    #[test]
    fn accepts_complete_agent_run_completed() {
        let event = validate_event(&agent_completed()).expect("valid event");
        assert_eq!(event.kind(), EventKind::AgentRunCompleted);
        assert_eq!(event.envelope.tenant_id, "acme");
        match event.body {
            EventBody::AgentRunCompleted(body) => {
                assert_eq!(body.agent.agent_id, "summarizer");
                assert_eq!(body.metrics.faithfulness, Some(0.93));
                assert!(body.output.is_none());
            }
            other => panic!("wrong body: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_top_level_property() {
        let mut event = agent_completed();
        event["surprise"] = json!(1);
        let errors = validate_event(&event).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.keyword == "additionalProperties" && e.path == "/surprise"));
    }

    #[test]
    fn rejects_unknown_nested_property() {
        let mut event = agent_completed();
        event["metrics"]["vibes"] = json!("good");
        let errors = validate_event(&event).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.keyword == "additionalProperties" && e.path == "/metrics/vibes"));
    }

    #[test]
    fn reports_missing_required_sub_object() {
        let event = base_event("AgentRunCompleted");
        let errors = validate_event(&event).unwrap_err();
        let missing: Vec<&str> = errors
            .iter()
            .filter(|e| e.keyword == "required")
            .filter_map(|e| e.params["missingProperty"].as_str())
            .collect();
        assert!(missing.contains(&"agent"));
        assert!(missing.contains(&"metrics"));
    }

    #[test]
    fn reports_bad_uuid_and_timestamp_formats() {
        let mut event = agent_completed();
        event["event_id"] = json!("not-a-uuid");
        event["event_time"] = json!("yesterday");
        let errors = validate_event(&event).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.path == "/event_id" && e.keyword == "format"));
        assert!(errors
            .iter()
            .any(|e| e.path == "/event_time" && e.keyword == "format"));
    }

    #[test]
    fn rejects_unknown_event_type() {
        let event = base_event("SomethingElse");
        let errors = validate_event(&event).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].keyword, "enum");
        assert_eq!(errors[0].path, "/type");
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let mut event = agent_completed();
        event["schema_version"] = json!("v2");
        let errors = validate_event(&event).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.keyword == "const" && e.path == "/schema_version"));
    }

    #[test]
    fn orchestration_completed_status_enum() {
        let mut event = base_event("OrchestrationRunCompleted");
        event["result"] = json!({"status": "exploded"});
        let errors = validate_event(&event).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.keyword == "enum" && e.path == "/result/status"));

        event["result"] = json!({"status": "success", "total_latency_ms": 4100});
        let parsed = validate_event(&event).expect("valid");
        match parsed.body {
            EventBody::OrchestrationRunCompleted(body) => {
                assert_eq!(body.total_latency_ms, Some(4100));
            }
            other => panic!("wrong body: {:?}", other),
        }
    }

    #[test]
    fn signal_value_variants() {
        let mut event = base_event("SignalEmitted");
        event["signal"] = json!({
            "signal_id": "11f3ac10-6c2f-4e8e-a2b2-30303a1f0b77",
            "horizon": "1d",
            "instrument_universe": [{"id": "AAPL", "weight": 2.0}, {"id": "MSFT"}],
            "value": {"kind": "vector", "values": {"AAPL": 0.8, "MSFT": -0.2}}
        });
        let parsed = validate_event(&event).expect("valid vector signal");
        match parsed.body {
            EventBody::SignalEmitted(signal) => match signal.value {
                super::super::payloads::SignalValue::Vector { values } => {
                    assert_eq!(values.len(), 2);
                }
                other => panic!("wrong variant: {:?}", other),
            },
            other => panic!("wrong body: {:?}", other),
        }

        event["signal"]["value"] = json!({"kind": "sentiment"});
        let errors = validate_event(&event).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.keyword == "enum" && e.path == "/signal/value/kind"));

        event["signal"]["value"] = json!({"kind": "scalar"});
        let errors = validate_event(&event).unwrap_err();
        assert!(errors.iter().any(|e| e.keyword == "required"
            && e.params["missingProperty"] == "value"));
    }

    #[test]
    fn signal_universe_must_be_nonempty_objects() {
        let mut event = base_event("SignalEmitted");
        event["signal"] = json!({
            "signal_id": "11f3ac10-6c2f-4e8e-a2b2-30303a1f0b77",
            "horizon": "1w",
            "instrument_universe": [],
            "value": {"kind": "scalar", "value": 0.4}
        });
        let errors = validate_event(&event).unwrap_err();
        assert!(errors.iter().any(|e| e.keyword == "minItems"));
    }

    #[test]
    fn batch_wrapped_and_bare_forms() {
        let bare = json!([agent_completed()]);
        assert_eq!(validate_batch(&bare).expect("bare array").len(), 1);

        let wrapped = json!({"schema_version": "v1", "events": [agent_completed()]});
        assert_eq!(validate_batch(&wrapped).expect("wrapped").len(), 1);

        let wrong_version = json!({"schema_version": "v0", "events": []});
        let errors = validate_batch(&wrong_version).unwrap_err();
        assert!(errors.iter().any(|e| e.keyword == "const"));
    }

    #[test]
    fn batch_errors_carry_item_index() {
        let mut bad = agent_completed();
        bad["metrics"]["latency_ms"] = json!("fast");
        let batch = json!([agent_completed(), bad]);
        let errors = validate_batch(&batch).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.path == "/events/1/metrics/latency_ms" && e.keyword == "type"));
    }

    #[test]
    fn retrieval_context_is_opaque() {
        let mut event = base_event("RetrievalContextAttached");
        event["context"] = json!({"chunks": [{"uri": "s3://x", "score": 0.8}], "free_form": true});
        let parsed = validate_event(&event).expect("opaque context accepted");
        assert_eq!(parsed.kind(), EventKind::RetrievalContextAttached);
    }

    #[test]
    fn market_outcome_required_fields() {
        let mut event = base_event("MarketOutcomeIngested");
        event["outcome"] = json!({
            "dataset_version": "ds-2025-06",
            "instrument_id": "AAPL",
            "asof_time": "2025-06-02T10:00:00Z",
            "realized_return": 0.012
        });
        let parsed = validate_event(&event).expect("valid outcome");
        match parsed.body {
            EventBody::MarketOutcomeIngested(outcome) => {
                assert_eq!(outcome.benchmark_return, None);
            }
            other => panic!("wrong body: {:?}", other),
        }

        event["outcome"]["realized_return"] = json!(null);
        assert!(validate_event(&event).is_err());
    }
}
