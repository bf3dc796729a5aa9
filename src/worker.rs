//! Materialization worker: drains the raw-event queue into the normalized
//! store.
//!
//! Each cycle claims a batch under `FOR UPDATE SKIP LOCKED` so replicas never
//! contend over rows, then processes every claimed event inside its own
//! savepoint. A malformed event rolls back only its savepoint, gets its
//! attempt count bumped, and after `max_attempts` is parked as terminal dead
//! with the error preserved. The cycle commits as a whole, releasing claims.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit;
use crate::config::Config;
use crate::events::schema;
use crate::metrics::PipelineMetrics;
use crate::store::materialize;

const ERROR_TRUNCATE_CHARS: usize = 1000;

struct ClaimedEvent {
    tenant_id: String,
    event_id: Uuid,
    event_type: String,
    payload: Value,
    attempt_count: i32,
}

pub async fn run(pool: PgPool, config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(PipelineMetrics::new());
    info!(
        batch_size = config.worker.batch_size,
        max_attempts = config.worker.max_attempts,
        "Materialization worker started"
    );

    let shutdown = crate::ingest::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Worker shutting down after in-flight cycle");
                pool.close().await;
                return Ok(());
            }
            cycle = run_cycle(&pool, &config, &metrics) => {
                match cycle {
                    Ok(0) => {
                        tokio::time::sleep(Duration::from_millis(config.worker.idle_sleep_ms)).await;
                    }
                    Ok(n) => {
                        debug!(claimed = n, "Worker cycle complete");
                    }
                    Err(e) => {
                        error!("Worker cycle failed: {:#}", e);
                        tokio::time::sleep(Duration::from_millis(config.worker.idle_sleep_ms)).await;
                    }
                }
            }
        }
    }
}

/// One claim-process-commit cycle. Returns the number of claimed rows.
pub async fn run_cycle(
    pool: &PgPool,
    config: &Config,
    metrics: &PipelineMetrics,
) -> anyhow::Result<usize> {
    PipelineMetrics::incr(&metrics.worker_cycles_total);

    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT tenant_id, event_id, event_type, payload, attempt_count
        FROM raw_events
        WHERE processed_at IS NULL AND attempt_count < $1
        ORDER BY ingest_time, event_time, event_id
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(config.worker.max_attempts)
    .bind(config.worker.batch_size)
    .fetch_all(&mut *tx)
    .await?;

    let claimed: Vec<ClaimedEvent> = rows
        .iter()
        .map(|row| ClaimedEvent {
            tenant_id: row.get("tenant_id"),
            event_id: row.get("event_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            attempt_count: row.get("attempt_count"),
        })
        .collect();

    if claimed.is_empty() {
        tx.commit().await?;
        return Ok(0);
    }

    let mut dead: Vec<(String, Uuid, String)> = Vec::new();

    for event in &claimed {
        let outcome = process_one(&mut tx, event, config).await;
        match outcome {
            Ok(()) => {
                mark_processed(&mut tx, event).await?;
                PipelineMetrics::incr(&metrics.worker_processed_total);
            }
            Err(e) => {
                PipelineMetrics::incr(&metrics.worker_failed_total);
                let message = truncate_error(&format!("{:#}", e));
                let attempts_after = event.attempt_count + 1;
                let terminal = attempts_after >= config.worker.max_attempts;
                warn!(
                    tenant = %event.tenant_id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    attempts = attempts_after,
                    terminal,
                    "Event processing failed: {}",
                    message
                );
                mark_failed(&mut tx, event, &message, terminal).await?;
                if terminal {
                    dead.push((event.tenant_id.clone(), event.event_id, message));
                }
            }
        }
    }

    let count = claimed.len();
    tx.commit().await?;

    // Terminal failures are audited outside the claiming transaction; the
    // audit trail is best-effort and must not hold locks.
    for (tenant_id, event_id, message) in dead {
        audit::record(
            pool,
            Some(&tenant_id),
            "worker",
            "raw_event.terminal_failure",
            serde_json::json!({"event_id": event_id, "error": message}),
        )
        .await;
    }

    Ok(count)
}

/// Revalidate and materialize one event inside a savepoint.
async fn process_one(
    tx: &mut Transaction<'_, Postgres>,
    event: &ClaimedEvent,
    config: &Config,
) -> anyhow::Result<()> {
    let validated = schema::validate_event(&event.payload).map_err(|errors| {
        let summary: Vec<String> = errors
            .iter()
            .take(5)
            .map(|e| format!("{} {}: {}", e.keyword, e.path, e.message))
            .collect();
        anyhow::anyhow!("payload failed revalidation: {}", summary.join("; "))
    })?;

    // Tenant and id in the stored row are authoritative; a payload that
    // disagrees was corrupted somewhere and must not cross tenants.
    if validated.envelope.tenant_id != event.tenant_id {
        anyhow::bail!(
            "payload tenant '{}' does not match row tenant",
            validated.envelope.tenant_id
        );
    }

    let mut savepoint = tx.begin().await?;
    match materialize::apply_event(&mut savepoint, &validated, &config.workflow_overrides).await {
        Ok(()) => {
            savepoint.commit().await?;
            Ok(())
        }
        Err(e) => {
            savepoint.rollback().await?;
            Err(e)
        }
    }
}

async fn mark_processed(
    tx: &mut Transaction<'_, Postgres>,
    event: &ClaimedEvent,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE raw_events
        SET processed_at = now(), processing_error = NULL
        WHERE tenant_id = $1 AND event_id = $2
        "#,
    )
    .bind(&event.tenant_id)
    .bind(event.event_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Record a failed attempt; terminal failures are parked by setting
/// `processed_at` so the claim scan skips them forever.
async fn mark_failed(
    tx: &mut Transaction<'_, Postgres>,
    event: &ClaimedEvent,
    message: &str,
    terminal: bool,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE raw_events
        SET attempt_count = attempt_count + 1,
            processing_error = $3,
            processed_at = CASE WHEN $4 THEN now() ELSE processed_at END
        WHERE tenant_id = $1 AND event_id = $2
        "#,
    )
    .bind(&event.tenant_id)
    .bind(event.event_id)
    .bind(message)
    .bind(terminal)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= ERROR_TRUNCATE_CHARS {
        return message.to_string();
    }
    message.chars().take(ERROR_TRUNCATE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_error_caps_length() {
        let long = "x".repeat(5000);
        assert_eq!(truncate_error(&long).len(), ERROR_TRUNCATE_CHARS);
        assert_eq!(truncate_error("short"), "short");
    }

    #[tokio::test]
    async fn worker_cycle_is_a_noop_on_empty_queue() {
        // Requires a live database; skipped otherwise.
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let pool = PgPool::connect(&url).await.expect("connect");
        crate::db::migrations::migrate_all(&pool).await.expect("migrate");
        std::env::set_var("DATABASE_URL", &url);
        let config = Config::from_env().expect("config");
        let metrics = PipelineMetrics::new();
        let claimed = run_cycle(&pool, &config, &metrics).await.expect("cycle");
        assert_eq!(claimed, 0);
    }
}
