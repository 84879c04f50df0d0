use anyhow::Result;
use sqlx::{Pool, Row, Sqlite};

use crate::persistency::types::LogRow;

/// Persisted engine log lines, for the observability readers.
pub struct LogRepository {
    pool: Pool<Sqlite>,
}

impl LogRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        level: &str,
        module: &str,
        message: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO logs(level, module, message, detail) VALUES (?, ?, ?, ?)")
            .bind(level)
            .bind(module)
            .bind(message)
            .bind(detail)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Newest lines first.
    pub async fn tail(&self, limit: i64) -> Result<Vec<LogRow>> {
        let rows = sqlx::query(
            "SELECT id, level, module, message, detail, created_at FROM logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut lines = Vec::new();
        for row in rows {
            lines.push(LogRow {
                id: row.try_get("id")?,
                level: row.try_get("level")?,
                module: row.try_get("module")?,
                message: row.try_get("message")?,
                detail: row.try_get("detail")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(lines)
    }
}
