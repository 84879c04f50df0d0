use anyhow::Result;
use sqlx::{Pool, Row, Sqlite};

use crate::persistency::now_iso;
use crate::persistency::types::SyncRun;

/// Append-only sync-run records.
pub struct SyncRunRepository {
    pool: Pool<Sqlite>,
}

impl SyncRunRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Open a run row in `running` state; returns its id.
    pub async fn insert_running(&self, run_type: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO sync_runs(run_type, status, started_at, summary_json) VALUES (?, 'running', ?, '{}')",
        )
        .bind(run_type)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Close a run row with its final status and summary document.
    pub async fn finish(&self, run_id: i64, status: &str, summary_json: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_runs SET status = ?, finished_at = ?, summary_json = ? WHERE id = ?",
        )
        .bind(status)
        .bind(now_iso())
        .bind(summary_json)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, run_id: i64) -> Result<Option<SyncRun>> {
        let row = sqlx::query(
            "SELECT id, run_type, status, started_at, finished_at, summary_json FROM sync_runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_run).transpose()
    }

    /// Newest runs first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            "SELECT id, run_type, status, started_at, finished_at, summary_json FROM sync_runs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_run).collect()
    }

    fn row_to_run(row: sqlx::sqlite::SqliteRow) -> Result<SyncRun> {
        Ok(SyncRun {
            id: row.try_get("id")?,
            run_type: row.try_get("run_type")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            summary_json: row
                .try_get::<Option<String>, _>("summary_json")?
                .unwrap_or_default(),
        })
    }
}
