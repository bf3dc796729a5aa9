//! Recommended-action store with cooldown-based deduplication.
//!
//! Jobs propose mitigations (sampling bumps, human review, fallback routing,
//! investigations); the store inserts them as `open` rows unless an equal-type,
//! equal-target open action already exists inside the action type's cooldown
//! window. Targets are compared by canonical JSON string so that key order in
//! the proposing job cannot defeat the dedup.

use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit;

pub const STATUS_OPEN: &str = "open";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    IncreaseEvalSampling,
    RequireHumanReview,
    RouteFallback,
    RunInvestigation,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::IncreaseEvalSampling => "increase_eval_sampling",
            ActionType::RequireHumanReview => "require_human_review",
            ActionType::RouteFallback => "route_fallback",
            ActionType::RunInvestigation => "run_investigation",
        }
    }

    /// Dedup cooldown per action type.
    pub fn cooldown_hours(&self) -> i64 {
        match self {
            ActionType::IncreaseEvalSampling => 6,
            ActionType::RequireHumanReview => 12,
            ActionType::RouteFallback => 12,
            ActionType::RunInvestigation => 6,
        }
    }
}

/// Canonical JSON rendering of a target: objects get their keys sorted
/// recursively, then the whole value is serialized compactly.
pub fn canonical_target_key(target: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), canonicalize(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(target).to_string()
}

pub struct ActionStore {
    pool: PgPool,
}

impl ActionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// True when an open action of this type for this exact target was created
    /// within the lookback window.
    pub async fn has_recent_open_action(
        &self,
        tenant_id: &str,
        action_type: ActionType,
        target_key: &str,
        lookback_hours: i64,
    ) -> anyhow::Result<bool> {
        let row = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM recommended_actions
            WHERE tenant_id = $1
              AND action_type = $2
              AND target_key = $3
              AND status = $4
              AND created_at >= now() - make_interval(hours => $5::int)
            "#,
        )
        .bind(tenant_id)
        .bind(action_type.as_str())
        .bind(target_key)
        .bind(STATUS_OPEN)
        .bind(lookback_hours as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(row > 0)
    }

    /// Insert an open action unless an equal one is still inside its cooldown.
    /// Returns the new action id, or `None` when deduplicated away.
    pub async fn propose(
        &self,
        tenant_id: &str,
        action_type: ActionType,
        target: Value,
        payload: Value,
        decided_by: &str,
    ) -> anyhow::Result<Option<Uuid>> {
        let target_key = canonical_target_key(&target);
        if self
            .has_recent_open_action(
                tenant_id,
                action_type,
                &target_key,
                action_type.cooldown_hours(),
            )
            .await?
        {
            debug!(
                tenant = %tenant_id,
                action_type = action_type.as_str(),
                target = %target_key,
                "Skipping duplicate recommended action"
            );
            return Ok(None);
        }

        let action_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO recommended_actions
                (tenant_id, action_id, action_type, target, target_key, payload, decided_by, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(tenant_id)
        .bind(action_id)
        .bind(action_type.as_str())
        .bind(&target)
        .bind(&target_key)
        .bind(&payload)
        .bind(decided_by)
        .bind(STATUS_OPEN)
        .execute(&self.pool)
        .await?;

        info!(
            tenant = %tenant_id,
            action_type = action_type.as_str(),
            action_id = %action_id,
            "Created recommended action"
        );

        audit::record(
            &self.pool,
            Some(tenant_id),
            decided_by,
            "recommended_action.created",
            serde_json::json!({
                "action_id": action_id,
                "action_type": action_type.as_str(),
                "target": target,
            }),
        )
        .await;

        Ok(Some(action_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_key_is_order_insensitive() {
        let a = json!({"workflow_id": "wf", "agent_id": "a", "agent_version": "1"});
        let b = json!({"agent_version": "1", "agent_id": "a", "workflow_id": "wf"});
        assert_eq!(canonical_target_key(&a), canonical_target_key(&b));
    }

    #[test]
    fn canonical_key_recurses_into_nested_objects() {
        let a = json!({"outer": {"b": 2, "a": 1}, "list": [{"y": 0, "x": 0}]});
        let b = json!({"list": [{"x": 0, "y": 0}], "outer": {"a": 1, "b": 2}});
        assert_eq!(canonical_target_key(&a), canonical_target_key(&b));
    }

    #[test]
    fn canonical_key_distinguishes_values() {
        let a = json!({"agent_id": "a"});
        let b = json!({"agent_id": "b"});
        assert_ne!(canonical_target_key(&a), canonical_target_key(&b));
    }

    #[test]
    fn cooldowns_match_policy() {
        assert_eq!(ActionType::IncreaseEvalSampling.cooldown_hours(), 6);
        assert_eq!(ActionType::RequireHumanReview.cooldown_hours(), 12);
        assert_eq!(ActionType::RouteFallback.cooldown_hours(), 12);
        assert_eq!(ActionType::RunInvestigation.cooldown_hours(), 6);
    }
}
