//! Ingest-side persistence: the idempotency ledger, the raw-event insert, and
//! the dead-letter sink.

use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};

use crate::events::EventV1;

/// Outcome of attempting to open an idempotency ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOutcome {
    /// Row inserted; this request owns the key.
    Fresh,
    /// Same payload already completed; replay the cached response.
    Completed { status: i32, body: Value },
    /// Same payload is still being processed by another request.
    InProgress,
    /// Different payload for the key, or the prior attempt failed.
    Conflict,
}

/// Insert the ledger row with status `processing`, or classify the existing
/// row for this `(tenant, key)`.
pub async fn begin_ledger(
    pool: &PgPool,
    tenant_id: &str,
    idempotency_key: &str,
    request_sha256: &str,
) -> anyhow::Result<LedgerOutcome> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO ingest_requests (tenant_id, idempotency_key, request_sha256, status)
        VALUES ($1, $2, $3, 'processing')
        ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
        "#,
    )
    .bind(tenant_id)
    .bind(idempotency_key)
    .bind(request_sha256)
    .execute(pool)
    .await?
    .rows_affected();

    if inserted == 1 {
        return Ok(LedgerOutcome::Fresh);
    }

    let row = sqlx::query(
        r#"
        SELECT request_sha256, status, response_status, response_body
        FROM ingest_requests
        WHERE tenant_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(tenant_id)
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        // Lost a race with a concurrent delete; treat as in progress and let
        // the caller retry.
        return Ok(LedgerOutcome::InProgress);
    };

    let prior_sha: String = row.get("request_sha256");
    let status: String = row.get("status");
    if prior_sha != request_sha256 {
        return Ok(LedgerOutcome::Conflict);
    }
    match status.as_str() {
        "completed" => {
            let response_status: Option<i32> = row.get("response_status");
            let response_body: Option<Value> = row.get("response_body");
            match (response_status, response_body) {
                (Some(status), Some(body)) => Ok(LedgerOutcome::Completed { status, body }),
                _ => Ok(LedgerOutcome::Conflict),
            }
        }
        "processing" => Ok(LedgerOutcome::InProgress),
        _ => Ok(LedgerOutcome::Conflict),
    }
}

/// Finalize the ledger row as completed, caching the response. Runs on the
/// same transaction as the raw-event insert so the two commit atomically.
pub async fn complete_ledger(
    conn: &mut PgConnection,
    tenant_id: &str,
    idempotency_key: &str,
    response_status: i32,
    response_body: &Value,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE ingest_requests
        SET status = 'completed', response_status = $3, response_body = $4, updated_at = now()
        WHERE tenant_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(tenant_id)
    .bind(idempotency_key)
    .bind(response_status)
    .bind(response_body)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn fail_ledger(
    pool: &PgPool,
    tenant_id: &str,
    idempotency_key: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE ingest_requests
        SET status = 'failed', updated_at = now()
        WHERE tenant_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(tenant_id)
    .bind(idempotency_key)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert a batch of validated events in one multi-row statement, ignoring
/// `(tenant, event_id)` duplicates. Returns the number of rows actually
/// inserted.
pub async fn insert_raw_events(
    conn: &mut PgConnection,
    events: &[(EventV1, Value)],
    idempotency_key: Option<&str>,
) -> anyhow::Result<u64> {
    if events.is_empty() {
        return Ok(0);
    }

    let mut sql = String::from(
        "INSERT INTO raw_events \
         (tenant_id, event_id, schema_version, event_type, event_time, payload, idempotency_key) \
         VALUES ",
    );
    for i in 0..events.len() {
        if i > 0 {
            sql.push_str(", ");
        }
        let base = i * 7;
        sql.push_str(&format!(
            "(${}, ${}, ${}, ${}, ${}, ${}, ${})",
            base + 1,
            base + 2,
            base + 3,
            base + 4,
            base + 5,
            base + 6,
            base + 7
        ));
    }
    sql.push_str(" ON CONFLICT (tenant_id, event_id) DO NOTHING");

    let mut query = sqlx::query(&sql);
    for (event, raw) in events {
        query = query
            .bind(&event.envelope.tenant_id)
            .bind(event.envelope.event_id)
            .bind(&event.envelope.schema_version)
            .bind(event.kind().as_str())
            .bind(event.envelope.event_time)
            .bind(raw)
            .bind(idempotency_key);
    }

    Ok(query.execute(conn).await?.rows_affected())
}

/// Append a rejected batch (or event) to the dead-letter sink.
pub async fn dead_letter(
    pool: &PgPool,
    tenant_id: Option<&str>,
    reason: &str,
    errors: Value,
    body: Option<&Value>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO dead_letter_events (tenant_id, reason, errors, body) VALUES ($1, $2, $3, $4)",
    )
    .bind(tenant_id)
    .bind(reason)
    .bind(errors)
    .bind(body)
    .execute(pool)
    .await?;
    Ok(())
}
