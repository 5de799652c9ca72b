//! Dispatch attempt log.

use sqlx::SqlitePool;

/// One delivery attempt ready for database insertion.
///
/// All fields are owned types to satisfy `tokio::spawn` `'static` requirement.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub correlation_id: String,
    pub timestamp: String,
    pub route_id: String,
    pub rule_id: String,
    pub service_id: String,
    pub model: String,
    pub content_type: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub tokens_used: Option<u64>,
    pub latency_ms: i64,
    pub error_message: Option<String>,
}

impl AttemptRecord {
    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO dispatch_attempts (
                correlation_id, timestamp, route_id, rule_id, service_id,
                model, content_type, success, status_code, tokens_used,
                latency_ms, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.correlation_id)
        .bind(&self.timestamp)
        .bind(&self.route_id)
        .bind(&self.rule_id)
        .bind(&self.service_id)
        .bind(&self.model)
        .bind(&self.content_type)
        .bind(self.success)
        .bind(self.status_code.map(|v| v as i32))
        .bind(self.tokens_used.map(|v| v as i64))
        .bind(self.latency_ms)
        .bind(self.error_message.as_deref())
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Spawn a fire-and-forget attempt write.
///
/// If the write fails, a warning is logged but the error is not propagated.
pub fn spawn_attempt_write(pool: &SqlitePool, record: AttemptRecord) {
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = record.insert(&pool).await {
            tracing::warn!(
                correlation_id = %record.correlation_id,
                rule = %record.rule_id,
                error = %e,
                "Failed to write dispatch attempt to database"
            );
        }
    });
}

/// Attempts recorded for a rule, newest first.
pub async fn attempts_for_rule(
    pool: &SqlitePool,
    rule_id: &str,
    limit: i64,
) -> Result<Vec<(String, bool, Option<i32>)>, sqlx::Error> {
    sqlx::query_as::<_, (String, bool, Option<i32>)>(
        "SELECT correlation_id, success, status_code FROM dispatch_attempts
         WHERE rule_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(rule_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_memory_pool;

    fn record(correlation_id: &str, success: bool, status: Option<u16>) -> AttemptRecord {
        AttemptRecord {
            correlation_id: correlation_id.to_string(),
            timestamp: "2025-03-01T00:00:00Z".to_string(),
            route_id: "main".to_string(),
            rule_id: "r1".to_string(),
            service_id: "svc".to_string(),
            model: "claude-sonnet".to_string(),
            content_type: "default".to_string(),
            success,
            status_code: status,
            tokens_used: success.then_some(10),
            latency_ms: 12,
            error_message: (!success).then(|| "upstream returned 500".to_string()),
        }
    }

    #[tokio::test]
    async fn test_insert_and_query() {
        let pool = init_memory_pool().await.unwrap();
        record("c1", false, Some(500)).insert(&pool).await.unwrap();
        record("c1", true, Some(200)).insert(&pool).await.unwrap();

        let rows = attempts_for_rule(&pool, "r1", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("c1".to_string(), true, Some(200)));
        assert_eq!(rows[1], ("c1".to_string(), false, Some(500)));

        assert!(attempts_for_rule(&pool, "other", 10).await.unwrap().is_empty());
    }
}
