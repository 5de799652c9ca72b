//! Persistent per-rule usage counters.

use sqlx::SqlitePool;

use crate::budget::{RuleUsage, UsageSink};

/// A persisted usage row.
#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    rule_id: String,
    total_tokens_used: i64,
    total_requests_used: i64,
    last_reset_at: i64,
    revision: i64,
}

/// Write-behind store for the budget tracker.
#[derive(Clone)]
pub struct UsageStore {
    pool: SqlitePool,
}

impl UsageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a rule's counters unless a newer revision is already stored.
    ///
    /// Returns whether the row changed.
    pub async fn write(
        &self,
        rule_id: &str,
        usage: RuleUsage,
        revision: u64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO rule_usage (
                rule_id, total_tokens_used, total_requests_used, last_reset_at, revision
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(rule_id) DO UPDATE SET
                total_tokens_used = excluded.total_tokens_used,
                total_requests_used = excluded.total_requests_used,
                last_reset_at = excluded.last_reset_at,
                revision = excluded.revision
            WHERE excluded.revision > rule_usage.revision",
        )
        .bind(rule_id)
        .bind(usage.total_tokens_used as i64)
        .bind(usage.total_requests_used as i64)
        .bind(usage.last_reset_at)
        .bind(revision as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every stored row as `(rule_id, usage, revision)`.
    pub async fn load_all(&self) -> Result<Vec<(String, RuleUsage, u64)>, sqlx::Error> {
        let rows = sqlx::query_as::<_, UsageRow>(
            "SELECT rule_id, total_tokens_used, total_requests_used, last_reset_at, revision
             FROM rule_usage ORDER BY rule_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.rule_id,
                    RuleUsage {
                        total_tokens_used: row.total_tokens_used.max(0) as u64,
                        total_requests_used: row.total_requests_used.max(0) as u64,
                        last_reset_at: row.last_reset_at,
                    },
                    row.revision.max(0) as u64,
                )
            })
            .collect())
    }
}

impl UsageSink for UsageStore {
    /// Fire-and-forget write. Failures are logged, never propagated.
    fn persist(&self, rule_id: &str, usage: RuleUsage, revision: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(rule = %rule_id, "No runtime available, usage not persisted");
            return;
        };
        let store = self.clone();
        let rule_id = rule_id.to_string();
        runtime.spawn(async move {
            if let Err(e) = store.write(&rule_id, usage, revision).await {
                tracing::warn!(
                    rule = %rule_id,
                    revision,
                    error = %e,
                    "Failed to persist rule usage"
                );
            }
        });
    }
}
