use sqlx::PgPool;
use tracing::info;

/// Centralized migrations for every table the pipeline owns.
///
/// Each statement is safe to run repeatedly (`IF NOT EXISTS` everywhere), so
/// servers, workers, and jobs can all call this on startup without
/// coordination.
pub async fn migrate_all(pool: &PgPool) -> anyhow::Result<()> {
    migrate_ingest(pool).await?;
    migrate_runs(pool).await?;
    migrate_analytics(pool).await?;
    migrate_market(pool).await?;
    Ok(())
}

async fn migrate_ingest(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_events (
            tenant_id TEXT NOT NULL,
            event_id UUID NOT NULL,
            schema_version TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_time TIMESTAMPTZ NOT NULL,
            ingest_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            payload JSONB NOT NULL,
            idempotency_key TEXT,
            attempt_count INT NOT NULL DEFAULT 0,
            processed_at TIMESTAMPTZ,
            processing_error TEXT,
            PRIMARY KEY (tenant_id, event_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Worker claim scan: unprocessed rows in arrival order.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_events_pending
         ON raw_events (tenant_id, ingest_time, event_time, event_id)
         WHERE processed_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_requests (
            tenant_id TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            request_sha256 TEXT NOT NULL,
            status TEXT NOT NULL,
            response_status INT,
            response_body JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, idempotency_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letter_events (
            id BIGSERIAL PRIMARY KEY,
            tenant_id TEXT,
            reason TEXT NOT NULL,
            errors JSONB NOT NULL DEFAULT '[]'::jsonb,
            body JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id BIGSERIAL PRIMARY KEY,
            tenant_id TEXT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            details JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Ingest tables migration complete");
    Ok(())
}

async fn migrate_runs(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orchestration_runs (
            tenant_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            workflow_id TEXT,
            query_id TEXT,
            request_timestamp TIMESTAMPTZ,
            status TEXT NOT NULL DEFAULT 'running',
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            total_latency_ms BIGINT,
            error_code TEXT,
            error_message TEXT,
            orchestrator_name TEXT,
            orchestrator_version TEXT,
            client_id TEXT,
            user_id TEXT,
            query_text TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agent_runs (
            tenant_id TEXT NOT NULL,
            agent_run_id UUID NOT NULL,
            orchestration_run_id TEXT NOT NULL,
            agent_id TEXT,
            agent_version TEXT,
            model TEXT,
            config_hash TEXT,
            parent_agent_run_id UUID,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            latency_ms BIGINT,
            output_summary TEXT,
            output_uri TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, agent_run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_agent_runs_orchestration
         ON agent_runs (tenant_id, orchestration_run_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS evaluation_records (
            tenant_id TEXT NOT NULL,
            evaluation_id UUID NOT NULL,
            agent_run_id UUID NOT NULL,
            orchestration_run_id TEXT,
            workflow_id TEXT,
            agent_id TEXT,
            agent_version TEXT,
            latency_ms DOUBLE PRECISION NOT NULL,
            faithfulness DOUBLE PRECISION,
            hallucination_flag BOOLEAN,
            coverage DOUBLE PRECISION,
            confidence DOUBLE PRECISION,
            latency_norm DOUBLE PRECISION,
            faithfulness_norm DOUBLE PRECISION,
            hallucination_norm DOUBLE PRECISION,
            coverage_norm DOUBLE PRECISION,
            confidence_norm DOUBLE PRECISION,
            run_quality_score DOUBLE PRECISION,
            risk_score DOUBLE PRECISION,
            evaluator_version TEXT NOT NULL,
            normalization_version TEXT NOT NULL,
            weighting_version TEXT NOT NULL,
            scoring_timestamp TIMESTAMPTZ NOT NULL,
            anomaly_flag BOOLEAN NOT NULL DEFAULT FALSE,
            PRIMARY KEY (tenant_id, evaluation_id),
            UNIQUE (tenant_id, agent_run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Group scans used by every analysis job.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_group_time
         ON evaluation_records (tenant_id, workflow_id, agent_id, agent_version, scoring_timestamp DESC)",
    )
    .execute(pool)
    .await?;

    info!("Run tables migration complete");
    Ok(())
}

async fn migrate_analytics(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metric_rollups_hourly (
            tenant_id TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            agent_version TEXT NOT NULL,
            hour_bucket TIMESTAMPTZ NOT NULL,
            run_count BIGINT NOT NULL,
            latency_mean DOUBLE PRECISION,
            latency_stddev DOUBLE PRECISION,
            latency_p95 DOUBLE PRECISION,
            faithfulness_mean DOUBLE PRECISION,
            faithfulness_stddev DOUBLE PRECISION,
            faithfulness_p05 DOUBLE PRECISION,
            faithfulness_p10 DOUBLE PRECISION,
            faithfulness_p50 DOUBLE PRECISION,
            faithfulness_p95 DOUBLE PRECISION,
            quality_mean DOUBLE PRECISION,
            quality_stddev DOUBLE PRECISION,
            quality_p05 DOUBLE PRECISION,
            quality_p10 DOUBLE PRECISION,
            quality_p50 DOUBLE PRECISION,
            quality_p95 DOUBLE PRECISION,
            anomaly_count BIGINT NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, workflow_id, agent_id, agent_version, hour_bucket)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS anomalies (
            tenant_id TEXT NOT NULL,
            anomaly_id UUID NOT NULL,
            evaluation_id UUID NOT NULL,
            workflow_id TEXT,
            agent_id TEXT,
            agent_version TEXT,
            metric_name TEXT NOT NULL,
            method TEXT NOT NULL,
            metric_value DOUBLE PRECISION,
            threshold_low DOUBLE PRECISION,
            threshold_high DOUBLE PRECISION,
            z_score DOUBLE PRECISION,
            details JSONB NOT NULL DEFAULT '{}'::jsonb,
            detected_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, anomaly_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_anomalies_time
         ON anomalies (tenant_id, detected_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS performance_shifts (
            tenant_id TEXT NOT NULL,
            shift_id UUID NOT NULL,
            workflow_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            agent_version TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            window_a_start TIMESTAMPTZ NOT NULL,
            window_a_end TIMESTAMPTZ NOT NULL,
            window_b_start TIMESTAMPTZ NOT NULL,
            window_b_end TIMESTAMPTZ NOT NULL,
            method TEXT NOT NULL,
            p_value DOUBLE PRECISION,
            bh_adjusted_p_value DOUBLE PRECISION,
            effect_size DOUBLE PRECISION,
            significant BOOLEAN NOT NULL,
            details JSONB NOT NULL DEFAULT '{}'::jsonb,
            detected_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, shift_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_shifts_time
         ON performance_shifts (tenant_id, detected_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recommended_actions (
            tenant_id TEXT NOT NULL,
            action_id UUID NOT NULL,
            action_type TEXT NOT NULL,
            target JSONB NOT NULL,
            target_key TEXT NOT NULL,
            payload JSONB NOT NULL DEFAULT '{}'::jsonb,
            decided_by TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, action_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Dedup lookup: open actions of a type for an exact target within a window.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_actions_dedup
         ON recommended_actions (tenant_id, action_type, target_key, created_at DESC)",
    )
    .execute(pool)
    .await?;

    info!("Analytics tables migration complete");
    Ok(())
}

async fn migrate_market(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS signals (
            tenant_id TEXT NOT NULL,
            signal_id UUID NOT NULL,
            orchestration_run_id TEXT,
            event_time TIMESTAMPTZ NOT NULL,
            horizon TEXT NOT NULL,
            instrument_universe JSONB NOT NULL,
            signal_value JSONB NOT NULL,
            confidence DOUBLE PRECISION,
            constraints JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, signal_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_signals_horizon_time
         ON signals (tenant_id, horizon, event_time)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS market_outcomes (
            tenant_id TEXT NOT NULL,
            dataset_version TEXT NOT NULL,
            instrument_id TEXT NOT NULL,
            asof_time TIMESTAMPTZ NOT NULL,
            realized_return DOUBLE PRECISION NOT NULL,
            benchmark_return DOUBLE PRECISION,
            ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, dataset_version, instrument_id, asof_time)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS signal_outcomes (
            tenant_id TEXT NOT NULL,
            signal_id UUID NOT NULL,
            horizon TEXT NOT NULL,
            realized_return DOUBLE PRECISION NOT NULL,
            benchmark_return DOUBLE PRECISION NOT NULL,
            excess_return DOUBLE PRECISION NOT NULL,
            details JSONB NOT NULL DEFAULT '{}'::jsonb,
            computed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, signal_id, horizon)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backtest_runs (
            tenant_id TEXT NOT NULL,
            backtest_id UUID NOT NULL,
            dataset_version TEXT NOT NULL,
            horizon TEXT NOT NULL,
            window_start TIMESTAMPTZ NOT NULL,
            window_end TIMESTAMPTZ NOT NULL,
            cost_bps DOUBLE PRECISION NOT NULL,
            code_version TEXT NOT NULL,
            status TEXT NOT NULL,
            summary JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (tenant_id, backtest_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Market tables migration complete");
    Ok(())
}
