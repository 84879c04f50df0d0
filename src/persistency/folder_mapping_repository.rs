use anyhow::Result;
use sqlx::{Pool, Row, Sqlite};

use crate::persistency::types::FolderMapping;

/// Directory-to-folder mapping rows. Both columns are unique.
pub struct FolderMappingRepository {
    pool: Pool<Sqlite>,
}

impl FolderMappingRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, local_rel_dir: &str, remote_folder_token: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO folder_mappings(local_rel_dir, remote_folder_token)
            VALUES (?, ?)
            ON CONFLICT(local_rel_dir) DO UPDATE
               SET remote_folder_token = excluded.remote_folder_token,
                   updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(local_rel_dir)
        .bind(remote_folder_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<FolderMapping>> {
        let rows = sqlx::query(
            "SELECT id, local_rel_dir, remote_folder_token FROM folder_mappings ORDER BY local_rel_dir",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(FolderMapping {
                id: row.try_get("id")?,
                local_rel_dir: row.try_get("local_rel_dir")?,
                remote_folder_token: row.try_get("remote_folder_token")?,
            });
        }
        Ok(mappings)
    }

    pub async fn delete_by_token(&self, remote_folder_token: &str) -> Result<()> {
        sqlx::query("DELETE FROM folder_mappings WHERE remote_folder_token = ?")
            .bind(remote_folder_token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
