//! Request audit rows and key usage write-back.
//!
//! All writes on the request path are fire-and-forget: a failed insert is
//! logged and dropped, it never fails or delays the request itself.

use sqlx::SqlitePool;

/// A completed request ready for audit insertion.
///
/// All fields are owned types to satisfy `tokio::spawn` `'static` requirement.
pub struct RequestAudit {
    pub request_id: String,
    pub timestamp: String,
    pub endpoint: String,
    pub client_key_id: Option<i64>,
    pub alias: Option<String>,
    pub provider: Option<String>,
    pub key_id: Option<String>,
    pub status: u16,
    pub streaming: bool,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub latency_ms: i64,
    /// Serialized attempt chain for post-hoc fallback analysis.
    pub attempts: Option<String>,
}

impl RequestAudit {
    /// Insert this audit entry into the database.
    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO request_audit (
                request_id, timestamp, endpoint, client_key_id, alias,
                provider, key_id, status, streaming,
                input_tokens, output_tokens, latency_ms, attempts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.request_id)
        .bind(&self.timestamp)
        .bind(&self.endpoint)
        .bind(self.client_key_id)
        .bind(&self.alias)
        .bind(&self.provider)
        .bind(&self.key_id)
        .bind(self.status as i32)
        .bind(self.streaming)
        .bind(self.input_tokens)
        .bind(self.output_tokens)
        .bind(self.latency_ms)
        .bind(&self.attempts)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Spawn a fire-and-forget audit write.
pub fn spawn_audit_write(pool: &SqlitePool, entry: RequestAudit) {
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = entry.insert(&pool).await {
            tracing::warn!(
                request_id = %entry.request_id,
                error = %e,
                "Failed to write request audit row"
            );
        }
    });
}

/// Spawn a fire-and-forget key usage update.
///
/// Success resets the persisted consecutive-failure counter; failure
/// increments it. The authoritative eligibility decision stays in the
/// per-process health map, this row exists for operator visibility.
pub fn spawn_key_usage(pool: &SqlitePool, key_record_id: i64, success: bool) {
    let pool = pool.clone();
    tokio::spawn(async move {
        let result = if success {
            sqlx::query(
                "UPDATE api_keys
                 SET consecutive_failures = 0, last_used_at = datetime('now')
                 WHERE id = ?",
            )
            .bind(key_record_id)
            .execute(&pool)
            .await
        } else {
            sqlx::query(
                "UPDATE api_keys
                 SET consecutive_failures = consecutive_failures + 1,
                     last_failed_at = datetime('now')
                 WHERE id = ?",
            )
            .bind(key_record_id)
            .execute(&pool)
            .await
        };
        if let Err(e) = result {
            tracing::warn!(key_record_id, error = %e, "Failed to update key usage");
        }
    });
}

/// Spawn a fire-and-forget demotion of a key to `failed` status.
pub fn spawn_key_demotion(pool: &SqlitePool, key_record_id: i64) {
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = sqlx::query(
            "UPDATE api_keys
             SET status = 'failed', last_failed_at = datetime('now')
             WHERE id = ?",
        )
        .bind(key_record_id)
        .execute(&pool)
        .await
        {
            tracing::warn!(key_record_id, error = %e, "Failed to demote key");
        }
    });
}
