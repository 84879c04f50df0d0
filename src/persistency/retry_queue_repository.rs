//! Durable retry queue
//!
//! Failed operations are queued with exponential backoff and drained once at
//! the start of each run. Rows are discarded after the attempt bound.

use anyhow::Result;
use chrono::{Duration, Local};
use log::{debug, error};
use sqlx::{Pool, Row, Sqlite};

use crate::persistency::types::RetryRow;

/// Cap for the initial-enqueue backoff, seconds.
const ENQUEUE_BACKOFF_CAP_SECS: u64 = 300;

/// Cap for the after-failure reschedule backoff, seconds.
const RESCHEDULE_BACKOFF_CAP_SECS: u64 = 600;

/// Rows pulled per drain, keeping per-run time predictable.
pub const DRAIN_BATCH_SIZE: i64 = 50;

/// Backoff for a fresh enqueue: `min(300, 2^(attempt+1))` seconds.
pub fn enqueue_backoff_secs(attempt_count: u32) -> u64 {
    let exp = (attempt_count + 1).min(8);
    ENQUEUE_BACKOFF_CAP_SECS.min(1u64 << exp)
}

/// Backoff after a failed attempt: `min(600, 2^(attempt+1))` seconds.
pub fn reschedule_backoff_secs(attempt_count: u32) -> u64 {
    let exp = (attempt_count + 1).min(9);
    RESCHEDULE_BACKOFF_CAP_SECS.min(1u64 << exp)
}

fn at_iso(seconds_from_now: u64) -> String {
    (Local::now() + Duration::seconds(seconds_from_now as i64))
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

pub struct RetryQueueRepository {
    pool: Pool<Sqlite>,
}

impl RetryQueueRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Queue a failed operation for a later run.
    pub async fn enqueue(
        &self,
        op_type: &str,
        payload_json: &str,
        last_error: &str,
        attempt_count: u32,
    ) -> Result<()> {
        let next_retry_at = at_iso(enqueue_backoff_secs(attempt_count));
        sqlx::query(
            r#"
            INSERT INTO retry_queue(op_type, payload_json, attempt_count, next_retry_at, last_error)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(op_type)
        .bind(payload_json)
        .bind(attempt_count as i64)
        .bind(&next_retry_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        debug!("enqueued retry {} for {}", op_type, next_retry_at);
        Ok(())
    }

    /// Due rows, oldest first, bounded by the drain batch size.
    pub async fn due(&self) -> Result<Vec<RetryRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, op_type, payload_json, attempt_count, next_retry_at, last_error
            FROM retry_queue
            WHERE next_retry_at <= ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(crate::persistency::now_iso())
        .bind(DRAIN_BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;

        let mut due = Vec::new();
        for row in rows {
            due.push(RetryRow {
                id: row.try_get("id")?,
                op_type: row.try_get("op_type")?,
                payload_json: row
                    .try_get::<Option<String>, _>("payload_json")?
                    .unwrap_or_default(),
                attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
                next_retry_at: row.try_get("next_retry_at")?,
                last_error: row
                    .try_get::<Option<String>, _>("last_error")?
                    .unwrap_or_default(),
            });
        }
        Ok(due)
    }

    /// Remove a row after its operation succeeded (or was tombstoned).
    pub async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM retry_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reschedule a failed row with backoff, or discard it when the attempt
    /// bound is reached. Returns `true` when the row was discarded.
    pub async fn reschedule_failure(
        &self,
        row: &RetryRow,
        error: &str,
        max_retry: u32,
    ) -> Result<bool> {
        let attempt = row.attempt_count + 1;
        if attempt >= max_retry {
            self.remove(row.id).await?;
            error!("retry_discarded id={} error={}", row.id, error);
            return Ok(true);
        }

        let next_retry_at = at_iso(reschedule_backoff_secs(attempt));
        sqlx::query(
            r#"
            UPDATE retry_queue
               SET attempt_count = ?, next_retry_at = ?, last_error = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?
            "#,
        )
        .bind(attempt as i64)
        .bind(&next_retry_at)
        .bind(error)
        .bind(row.id)
        .execute(&self.pool)
        .await?;
        Ok(false)
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(1) AS n FROM retry_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_backoff_doubles_then_caps() {
        assert_eq!(enqueue_backoff_secs(0), 2);
        assert_eq!(enqueue_backoff_secs(1), 4);
        assert_eq!(enqueue_backoff_secs(6), 128);
        assert_eq!(enqueue_backoff_secs(7), 256);
        // Exponent clamps at 8, and the cap wins from there.
        assert_eq!(enqueue_backoff_secs(8), 256);
        assert_eq!(enqueue_backoff_secs(100), 256);
    }

    #[test]
    fn reschedule_backoff_has_the_higher_cap() {
        assert_eq!(reschedule_backoff_secs(0), 2);
        assert_eq!(reschedule_backoff_secs(7), 256);
        assert_eq!(reschedule_backoff_secs(8), 512);
        assert_eq!(reschedule_backoff_secs(100), 512);
    }
}
