use anyhow::Result;
use log::debug;
use sqlx::{Pool, Row, Sqlite};

use crate::persistency::types::{Tombstone, TombstoneSide};

/// Append-only tombstone rows. Written before the matching mapping is
/// marked deleted, keeping the audit order.
pub struct TombstoneRepository {
    pool: Pool<Sqlite>,
}

impl TombstoneRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        side: TombstoneSide,
        local_rel_path: Option<&str>,
        remote_token: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO tombstones(side, local_rel_path, remote_token, reason) VALUES (?, ?, ?, ?)",
        )
        .bind(side.as_str())
        .bind(local_rel_path)
        .bind(remote_token)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        debug!(
            "tombstone: side={} path={:?} token={:?} reason={}",
            side.as_str(),
            local_rel_path,
            remote_token,
            reason
        );
        Ok(())
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Tombstone>> {
        let rows = sqlx::query(
            r#"
            SELECT id, side, local_rel_path, remote_token, reason, created_at
            FROM tombstones ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut tombstones = Vec::new();
        for row in rows {
            let side_str: String = row.try_get("side")?;
            tombstones.push(Tombstone {
                id: row.try_get("id")?,
                side: TombstoneSide::from_str(&side_str).unwrap_or(TombstoneSide::Remote),
                local_rel_path: row.try_get("local_rel_path")?,
                remote_token: row.try_get("remote_token")?,
                reason: row.try_get("reason")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(tombstones)
    }

    /// Whether any tombstone references this path or token.
    pub async fn exists_for(
        &self,
        local_rel_path: Option<&str>,
        remote_token: Option<&str>,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(1) AS n FROM tombstones WHERE local_rel_path = ? OR remote_token = ?",
        )
        .bind(local_rel_path)
        .bind(remote_token)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }
}
