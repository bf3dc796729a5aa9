//! Append-only audit trail. Every write is best-effort: a failed audit insert
//! is logged and swallowed, never propagated to the caller.

use sqlx::PgPool;
use tracing::warn;

pub async fn record(
    pool: &PgPool,
    tenant_id: Option<&str>,
    actor: &str,
    action: &str,
    details: serde_json::Value,
) {
    let result = sqlx::query(
        "INSERT INTO audit_log (tenant_id, actor, action, details) VALUES ($1, $2, $3, $4)",
    )
    .bind(tenant_id)
    .bind(actor)
    .bind(action)
    .bind(details)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!(actor, action, "Audit write failed: {}", e);
    }
}
