//! State store for the sync daemon
//!
//! A single SQLite file holds settings, folder and file mappings,
//! tombstones, the retry queue, sync-run records, and engine log lines.
//! All writes happen from the run thread with row-level autocommit;
//! observability readers open their own handles and read committed rows.

pub mod file_mapping_repository;
pub mod folder_mapping_repository;
pub mod log_repository;
pub mod retry_queue_repository;
pub mod settings_repository;
pub mod sync_run_repository;
pub mod tombstone_repository;
pub mod types;

use anyhow::{Context, Result};
use chrono::Local;
use log::info;
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};

/// Local time rendered the way every timestamp column stores it.
pub fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Connection pool and schema owner for the embedded store.
pub struct StateStore {
    pool: Pool<Sqlite>,
    db_path: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) the database file and its pool.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("Failed to connect to database")?;

        info!("opened state store at {}", db_path.display());
        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Create every table and index. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
              key TEXT PRIMARY KEY,
              value TEXT,
              updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folder_mappings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              local_rel_dir TEXT UNIQUE,
              remote_folder_token TEXT UNIQUE,
              updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Uniqueness of path and token holds among non-deleted rows only;
        // a deleted row must not reserve its path or token against a later
        // rename or re-creation. Enforced by partial indexes below.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_mappings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              local_rel_path TEXT,
              remote_token TEXT,
              remote_type TEXT DEFAULT 'file',
              local_hash TEXT,
              remote_hash TEXT,
              local_mtime REAL,
              remote_modified_time TEXT,
              status TEXT DEFAULT 'active',
              conflict INTEGER DEFAULT 0,
              last_synced_at DATETIME,
              updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_file_mappings_live_path
            ON file_mappings(local_rel_path) WHERE status != 'deleted'
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_file_mappings_live_token
            ON file_mappings(remote_token) WHERE status != 'deleted'
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tombstones (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              side TEXT,
              local_rel_path TEXT,
              remote_token TEXT,
              reason TEXT,
              created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_queue (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              op_type TEXT,
              payload_json TEXT,
              attempt_count INTEGER DEFAULT 0,
              next_retry_at DATETIME,
              last_error TEXT,
              created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
              updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_type TEXT,
              status TEXT,
              started_at DATETIME DEFAULT CURRENT_TIMESTAMP,
              finished_at DATETIME,
              summary_json TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              level TEXT,
              module TEXT,
              message TEXT,
              detail TEXT,
              created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_file_mappings_remote_token ON file_mappings(remote_token)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_file_mappings_path ON file_mappings(local_rel_path)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_retry_next ON retry_queue(next_retry_at)")
            .execute(&self.pool)
            .await?;

        info!("state store schema ready");
        Ok(())
    }

    pub fn file_mappings(&self) -> file_mapping_repository::FileMappingRepository {
        file_mapping_repository::FileMappingRepository::new(self.pool.clone())
    }

    pub fn folder_mappings(&self) -> folder_mapping_repository::FolderMappingRepository {
        folder_mapping_repository::FolderMappingRepository::new(self.pool.clone())
    }

    pub fn tombstones(&self) -> tombstone_repository::TombstoneRepository {
        tombstone_repository::TombstoneRepository::new(self.pool.clone())
    }

    pub fn retry_queue(&self) -> retry_queue_repository::RetryQueueRepository {
        retry_queue_repository::RetryQueueRepository::new(self.pool.clone())
    }

    pub fn sync_runs(&self) -> sync_run_repository::SyncRunRepository {
        sync_run_repository::SyncRunRepository::new(self.pool.clone())
    }

    pub fn logs(&self) -> log_repository::LogRepository {
        log_repository::LogRepository::new(self.pool.clone())
    }

    pub fn settings(&self) -> settings_repository::SettingsRepository {
        settings_repository::SettingsRepository::new(self.pool.clone())
    }
}
