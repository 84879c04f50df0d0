//! File mapping rows
//!
//! The upsert looks up by local path first and remote token second; whichever
//! matches is updated in place. That keeps exactly one live row per local
//! path and per remote token even when a rename changes one side at a time.
//! Deleted rows stay behind as history and do not reserve their path or
//! token; lookups that can see both prefer the live row.

use anyhow::Result;
use log::debug;
use sqlx::{Pool, Row, Sqlite};

use crate::persistency::now_iso;
use crate::persistency::types::{FileMapping, FileMappingUpsert, MappingStatus};

pub struct FileMappingRepository {
    pool: Pool<Sqlite>,
}

impl FileMappingRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert or update the mapping for a path/token pair.
    pub async fn upsert(&self, m: &FileMappingUpsert) -> Result<()> {
        let existing_id: Option<i64> = {
            let by_path = sqlx::query(
                r#"
                SELECT id FROM file_mappings WHERE local_rel_path = ?
                ORDER BY (status = 'deleted'), id DESC LIMIT 1
                "#,
            )
            .bind(&m.local_rel_path)
            .fetch_optional(&self.pool)
            .await?;
            match by_path {
                Some(row) => Some(row.try_get("id")?),
                None => {
                    let by_token = sqlx::query(
                        r#"
                        SELECT id FROM file_mappings WHERE remote_token = ?
                        ORDER BY (status = 'deleted'), id DESC LIMIT 1
                        "#,
                    )
                    .bind(&m.remote_token)
                    .fetch_optional(&self.pool)
                    .await?;
                    match by_token {
                        Some(row) => Some(row.try_get("id")?),
                        None => None,
                    }
                }
            }
        };

        if let Some(id) = existing_id {
            sqlx::query(
                r#"
                UPDATE file_mappings
                   SET local_rel_path = ?, remote_token = ?, remote_type = ?,
                       local_hash = ?, remote_hash = ?, local_mtime = ?, remote_modified_time = ?,
                       status = ?, conflict = ?, last_synced_at = ?, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?
                "#,
            )
            .bind(&m.local_rel_path)
            .bind(&m.remote_token)
            .bind(&m.remote_type)
            .bind(&m.local_hash)
            .bind(&m.remote_hash)
            .bind(m.local_mtime)
            .bind(&m.remote_modified_time)
            .bind(m.status.as_str())
            .bind(m.conflict as i64)
            .bind(now_iso())
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO file_mappings(
                    local_rel_path, remote_token, remote_type,
                    local_hash, remote_hash, local_mtime, remote_modified_time,
                    status, conflict, last_synced_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&m.local_rel_path)
            .bind(&m.remote_token)
            .bind(&m.remote_type)
            .bind(&m.local_hash)
            .bind(&m.remote_hash)
            .bind(m.local_mtime)
            .bind(&m.remote_modified_time)
            .bind(m.status.as_str())
            .bind(m.conflict as i64)
            .bind(now_iso())
            .execute(&self.pool)
            .await?;
        }

        debug!(
            "upserted mapping {} -> {}",
            m.local_rel_path, m.remote_token
        );
        Ok(())
    }

    /// All mappings that are not deleted, oldest first.
    pub async fn load_live(&self) -> Result<Vec<FileMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, local_rel_path, remote_token, remote_type, local_hash, remote_hash,
                   local_mtime, remote_modified_time, status, conflict, last_synced_at
            FROM file_mappings WHERE status != 'deleted' ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_mapping).collect()
    }

    /// Total number of mapping rows, deleted ones included. Used by the
    /// initial-sync guard, which must only fire on a truly fresh store.
    pub async fn count_all(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(1) AS n FROM file_mappings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn get_by_path(&self, local_rel_path: &str) -> Result<Option<FileMapping>> {
        let row = sqlx::query(
            r#"
            SELECT id, local_rel_path, remote_token, remote_type, local_hash, remote_hash,
                   local_mtime, remote_modified_time, status, conflict, last_synced_at
            FROM file_mappings WHERE local_rel_path = ?
            ORDER BY (status = 'deleted'), id DESC LIMIT 1
            "#,
        )
        .bind(local_rel_path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_mapping).transpose()
    }

    pub async fn get_by_token(&self, remote_token: &str) -> Result<Option<FileMapping>> {
        let row = sqlx::query(
            r#"
            SELECT id, local_rel_path, remote_token, remote_type, local_hash, remote_hash,
                   local_mtime, remote_modified_time, status, conflict, last_synced_at
            FROM file_mappings WHERE remote_token = ?
            ORDER BY (status = 'deleted'), id DESC LIMIT 1
            "#,
        )
        .bind(remote_token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_mapping).transpose()
    }

    /// Soft-delete the live mapping row. Rows are never hard-deleted.
    pub async fn mark_deleted(&self, local_rel_path: &str) -> Result<()> {
        sqlx::query(
            "UPDATE file_mappings SET status = 'deleted', updated_at = CURRENT_TIMESTAMP WHERE local_rel_path = ? AND status != 'deleted'",
        )
        .bind(local_rel_path)
        .execute(&self.pool)
        .await?;
        debug!("marked mapping deleted: {}", local_rel_path);
        Ok(())
    }

    /// Rewrite the local side of the live mapping after a detected rename.
    /// Deleted rows holding the target path are history, not owners.
    pub async fn rename_path(&self, old_rel: &str, new_rel: &str) -> Result<()> {
        sqlx::query(
            "UPDATE file_mappings SET local_rel_path = ?, updated_at = CURRENT_TIMESTAMP WHERE local_rel_path = ? AND status != 'deleted'",
        )
        .bind(new_rel)
        .bind(old_rel)
        .execute(&self.pool)
        .await?;
        debug!("renamed mapping path {} -> {}", old_rel, new_rel);
        Ok(())
    }

    fn row_to_mapping(row: sqlx::sqlite::SqliteRow) -> Result<FileMapping> {
        let status_str: String = row.try_get("status")?;
        Ok(FileMapping {
            id: row.try_get("id")?,
            local_rel_path: row.try_get("local_rel_path")?,
            remote_token: row.try_get("remote_token")?,
            remote_type: row.try_get("remote_type")?,
            local_hash: row.try_get::<Option<String>, _>("local_hash")?.unwrap_or_default(),
            remote_hash: row.try_get::<Option<String>, _>("remote_hash")?.unwrap_or_default(),
            local_mtime: row.try_get::<Option<f64>, _>("local_mtime")?.unwrap_or(0.0),
            remote_modified_time: row
                .try_get::<Option<String>, _>("remote_modified_time")?
                .unwrap_or_default(),
            status: MappingStatus::from_str(&status_str).unwrap_or(MappingStatus::Active),
            conflict: row.try_get::<i64, _>("conflict")? != 0,
            last_synced_at: row.try_get("last_synced_at")?,
        })
    }
}
