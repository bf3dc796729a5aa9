//! Materialization of validated events into the normalized evaluation store.
//!
//! Every handler is an order-insensitive upsert: identity fields keep the
//! first non-null observation (`COALESCE(existing, new)`), start times take
//! the earliest (`LEAST`), completion fields never regress, and the
//! evaluation record insert is a no-op when one already exists for the agent
//! run. Replaying any event set in any order converges to the same state.
//!
//! All functions run on the worker's claiming transaction (or a savepoint of
//! it), so a failed event rolls back cleanly without touching its peers.

use std::collections::HashMap;

use sqlx::PgConnection;
use uuid::Uuid;

use crate::config::normalization::Override;
use crate::events::payloads::{
    AgentCompleted, AgentRef, OrchestrationCompleted, OrchestrationStarted, OutcomePayload,
    SignalPayload,
};
use crate::events::{Envelope, EventBody, EventV1};
use crate::normalize;

/// Dispatch one validated event into the store.
pub async fn apply_event(
    conn: &mut PgConnection,
    event: &EventV1,
    workflow_overrides: &HashMap<String, Override>,
) -> anyhow::Result<()> {
    let envelope = &event.envelope;
    match &event.body {
        EventBody::OrchestrationRunStarted(body) => {
            orchestration_started(conn, envelope, body).await
        }
        EventBody::OrchestrationRunCompleted(body) => {
            orchestration_completed(conn, envelope, body).await
        }
        EventBody::AgentRunStarted(agent) => {
            ensure_orchestration_run(conn, envelope).await?;
            agent_run_started(conn, envelope, agent).await
        }
        EventBody::AgentRunCompleted(body) => {
            ensure_orchestration_run(conn, envelope).await?;
            agent_run_completed(conn, envelope, body, workflow_overrides).await
        }
        // Reserved: acknowledged without materialization.
        EventBody::RetrievalContextAttached(_) => Ok(()),
        EventBody::SignalEmitted(signal) => signal_emitted(conn, envelope, signal).await,
        EventBody::MarketOutcomeIngested(outcome) => {
            market_outcome_ingested(conn, envelope, outcome).await
        }
    }
}

/// Create a placeholder orchestration run so that any event type referencing
/// a run can arrive first.
async fn ensure_orchestration_run(
    conn: &mut PgConnection,
    envelope: &Envelope,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO orchestration_runs
            (tenant_id, run_id, workflow_id, query_id, request_timestamp, status, started_at)
        VALUES ($1, $2, $3, $4, $5, 'running', $6)
        ON CONFLICT (tenant_id, run_id) DO NOTHING
        "#,
    )
    .bind(&envelope.tenant_id)
    .bind(&envelope.orchestration_run_id)
    .bind(&envelope.workflow_id)
    .bind(&envelope.query_id)
    .bind(envelope.request_timestamp)
    .bind(envelope.event_time)
    .execute(conn)
    .await?;
    Ok(())
}

async fn orchestration_started(
    conn: &mut PgConnection,
    envelope: &Envelope,
    body: &OrchestrationStarted,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO orchestration_runs
            (tenant_id, run_id, workflow_id, query_id, request_timestamp, status, started_at,
             orchestrator_name, orchestrator_version, client_id, user_id, query_text)
        VALUES ($1, $2, $3, $4, $5, 'running', $6, $7, $8, $9, $10, $11)
        ON CONFLICT (tenant_id, run_id) DO UPDATE SET
            workflow_id = COALESCE(orchestration_runs.workflow_id, EXCLUDED.workflow_id),
            query_id = COALESCE(orchestration_runs.query_id, EXCLUDED.query_id),
            request_timestamp = COALESCE(orchestration_runs.request_timestamp, EXCLUDED.request_timestamp),
            started_at = LEAST(orchestration_runs.started_at, EXCLUDED.started_at),
            orchestrator_name = COALESCE(orchestration_runs.orchestrator_name, EXCLUDED.orchestrator_name),
            orchestrator_version = COALESCE(orchestration_runs.orchestrator_version, EXCLUDED.orchestrator_version),
            client_id = COALESCE(orchestration_runs.client_id, EXCLUDED.client_id),
            user_id = COALESCE(orchestration_runs.user_id, EXCLUDED.user_id),
            query_text = COALESCE(orchestration_runs.query_text, EXCLUDED.query_text),
            updated_at = now()
        "#,
    )
    .bind(&envelope.tenant_id)
    .bind(&envelope.orchestration_run_id)
    .bind(&envelope.workflow_id)
    .bind(&envelope.query_id)
    .bind(envelope.request_timestamp)
    .bind(envelope.event_time)
    .bind(&body.orchestrator_name)
    .bind(&body.orchestrator_version)
    .bind(&body.client_id)
    .bind(&body.user_id)
    .bind(&body.query_text)
    .execute(conn)
    .await?;
    Ok(())
}

async fn orchestration_completed(
    conn: &mut PgConnection,
    envelope: &Envelope,
    body: &OrchestrationCompleted,
) -> anyhow::Result<()> {
    let completed_at = body.completed_at.unwrap_or(envelope.event_time);
    sqlx::query(
        r#"
        INSERT INTO orchestration_runs
            (tenant_id, run_id, workflow_id, query_id, request_timestamp, status, completed_at,
             total_latency_ms, error_code, error_message)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (tenant_id, run_id) DO UPDATE SET
            workflow_id = COALESCE(orchestration_runs.workflow_id, EXCLUDED.workflow_id),
            query_id = COALESCE(orchestration_runs.query_id, EXCLUDED.query_id),
            request_timestamp = COALESCE(orchestration_runs.request_timestamp, EXCLUDED.request_timestamp),
            status = EXCLUDED.status,
            completed_at = COALESCE(orchestration_runs.completed_at, EXCLUDED.completed_at),
            total_latency_ms = COALESCE(orchestration_runs.total_latency_ms, EXCLUDED.total_latency_ms),
            error_code = COALESCE(orchestration_runs.error_code, EXCLUDED.error_code),
            error_message = COALESCE(orchestration_runs.error_message, EXCLUDED.error_message),
            updated_at = now()
        "#,
    )
    .bind(&envelope.tenant_id)
    .bind(&envelope.orchestration_run_id)
    .bind(&envelope.workflow_id)
    .bind(&envelope.query_id)
    .bind(envelope.request_timestamp)
    .bind(body.status.as_str())
    .bind(completed_at)
    .bind(body.total_latency_ms)
    .bind(&body.error_code)
    .bind(&body.error_message)
    .execute(conn)
    .await?;
    Ok(())
}

async fn agent_run_started(
    conn: &mut PgConnection,
    envelope: &Envelope,
    agent: &AgentRef,
) -> anyhow::Result<()> {
    let started_at = agent.started_at.unwrap_or(envelope.event_time);
    sqlx::query(
        r#"
        INSERT INTO agent_runs
            (tenant_id, agent_run_id, orchestration_run_id, agent_id, agent_version,
             model, config_hash, parent_agent_run_id, started_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (tenant_id, agent_run_id) DO UPDATE SET
            agent_id = COALESCE(agent_runs.agent_id, EXCLUDED.agent_id),
            agent_version = COALESCE(agent_runs.agent_version, EXCLUDED.agent_version),
            model = COALESCE(agent_runs.model, EXCLUDED.model),
            config_hash = COALESCE(agent_runs.config_hash, EXCLUDED.config_hash),
            parent_agent_run_id = COALESCE(agent_runs.parent_agent_run_id, EXCLUDED.parent_agent_run_id),
            started_at = LEAST(agent_runs.started_at, EXCLUDED.started_at),
            updated_at = now()
        "#,
    )
    .bind(&envelope.tenant_id)
    .bind(agent.agent_run_id)
    .bind(&envelope.orchestration_run_id)
    .bind(&agent.agent_id)
    .bind(&agent.agent_version)
    .bind(&agent.model)
    .bind(&agent.config_hash)
    .bind(agent.parent_agent_run_id)
    .bind(started_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn agent_run_completed(
    conn: &mut PgConnection,
    envelope: &Envelope,
    body: &AgentCompleted,
    workflow_overrides: &HashMap<String, Override>,
) -> anyhow::Result<()> {
    let agent = &body.agent;
    let metrics = &body.metrics;
    let output = body.output.clone().unwrap_or_default();
    let completed_at = envelope.event_time;
    let latency_ms = metrics.latency_ms.max(0.0).round() as i64;

    sqlx::query(
        r#"
        INSERT INTO agent_runs
            (tenant_id, agent_run_id, orchestration_run_id, agent_id, agent_version,
             model, config_hash, parent_agent_run_id, completed_at, latency_ms,
             output_summary, output_uri)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (tenant_id, agent_run_id) DO UPDATE SET
            agent_id = COALESCE(agent_runs.agent_id, EXCLUDED.agent_id),
            agent_version = COALESCE(agent_runs.agent_version, EXCLUDED.agent_version),
            model = COALESCE(agent_runs.model, EXCLUDED.model),
            config_hash = COALESCE(agent_runs.config_hash, EXCLUDED.config_hash),
            parent_agent_run_id = COALESCE(agent_runs.parent_agent_run_id, EXCLUDED.parent_agent_run_id),
            completed_at = COALESCE(agent_runs.completed_at, EXCLUDED.completed_at),
            latency_ms = COALESCE(agent_runs.latency_ms, EXCLUDED.latency_ms),
            output_summary = COALESCE(agent_runs.output_summary, EXCLUDED.output_summary),
            output_uri = COALESCE(agent_runs.output_uri, EXCLUDED.output_uri),
            updated_at = now()
        "#,
    )
    .bind(&envelope.tenant_id)
    .bind(agent.agent_run_id)
    .bind(&envelope.orchestration_run_id)
    .bind(&agent.agent_id)
    .bind(&agent.agent_version)
    .bind(&agent.model)
    .bind(&agent.config_hash)
    .bind(agent.parent_agent_run_id)
    .bind(completed_at)
    .bind(latency_ms)
    .bind(&output.summary)
    .bind(&output.uri)
    .execute(&mut *conn)
    .await?;

    // Score the run. Exactly one evaluation record per agent run: a replayed
    // completion event is a no-op.
    let config = normalize::resolve_config(workflow_overrides.get(&envelope.workflow_id));
    let raw = normalize::RawMetrics {
        latency_ms: metrics.latency_ms,
        faithfulness: metrics.faithfulness,
        hallucination_flag: metrics.hallucination_flag,
        coverage: metrics.coverage,
        confidence: metrics.confidence,
    };
    let scored = normalize::score(&raw, &config);
    let evaluator_version = metrics
        .evaluator_version
        .clone()
        .unwrap_or_else(|| normalize::DEFAULT_EVALUATOR_VERSION.to_string());

    sqlx::query(
        r#"
        INSERT INTO evaluation_records
            (tenant_id, evaluation_id, agent_run_id, orchestration_run_id,
             workflow_id, agent_id, agent_version,
             latency_ms, faithfulness, hallucination_flag, coverage, confidence,
             latency_norm, faithfulness_norm, hallucination_norm, coverage_norm, confidence_norm,
             run_quality_score, risk_score,
             evaluator_version, normalization_version, weighting_version,
             scoring_timestamp)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
        ON CONFLICT (tenant_id, agent_run_id) DO NOTHING
        "#,
    )
    .bind(&envelope.tenant_id)
    .bind(Uuid::new_v4())
    .bind(agent.agent_run_id)
    .bind(&envelope.orchestration_run_id)
    .bind(&envelope.workflow_id)
    .bind(&agent.agent_id)
    .bind(&agent.agent_version)
    .bind(metrics.latency_ms)
    .bind(metrics.faithfulness)
    .bind(metrics.hallucination_flag)
    .bind(metrics.coverage)
    .bind(metrics.confidence)
    .bind(scored.latency_norm)
    .bind(scored.faithfulness_norm)
    .bind(scored.hallucination_norm)
    .bind(scored.coverage_norm)
    .bind(scored.confidence_norm)
    .bind(scored.run_quality_score)
    .bind(scored.risk_score)
    .bind(evaluator_version)
    .bind(normalize::NORMALIZATION_VERSION)
    .bind(normalize::WEIGHTING_VERSION)
    .bind(envelope.event_time)
    .execute(conn)
    .await?;

    Ok(())
}

async fn signal_emitted(
    conn: &mut PgConnection,
    envelope: &Envelope,
    signal: &SignalPayload,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO signals
            (tenant_id, signal_id, orchestration_run_id, event_time, horizon,
             instrument_universe, signal_value, confidence, constraints)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (tenant_id, signal_id) DO NOTHING
        "#,
    )
    .bind(&envelope.tenant_id)
    .bind(signal.signal_id)
    .bind(&envelope.orchestration_run_id)
    .bind(envelope.event_time)
    .bind(&signal.horizon)
    .bind(serde_json::to_value(&signal.instrument_universe)?)
    .bind(serde_json::to_value(&signal.value)?)
    .bind(signal.confidence)
    .bind(&signal.constraints)
    .execute(conn)
    .await?;
    Ok(())
}

async fn market_outcome_ingested(
    conn: &mut PgConnection,
    envelope: &Envelope,
    outcome: &OutcomePayload,
) -> anyhow::Result<()> {
    // Outcomes are immutable once inserted; replays are no-ops.
    sqlx::query(
        r#"
        INSERT INTO market_outcomes
            (tenant_id, dataset_version, instrument_id, asof_time, realized_return, benchmark_return)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (tenant_id, dataset_version, instrument_id, asof_time) DO NOTHING
        "#,
    )
    .bind(&envelope.tenant_id)
    .bind(&outcome.dataset_version)
    .bind(&outcome.instrument_id)
    .bind(outcome.asof_time)
    .bind(outcome.realized_return)
    .bind(outcome.benchmark_return)
    .execute(conn)
    .await?;
    Ok(())
}
