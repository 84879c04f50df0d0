//! Shared fixtures for the integration tests
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

pub mod mock_drive;

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use feishu_sync_daemon::config::{InitialSyncStrategy, RemoteDeleteMode, SyncDirection};
use feishu_sync_daemon::log_sink::RecordingLogSink;
use feishu_sync_daemon::persistency::StateStore;
use feishu_sync_daemon::sync::engine::{EngineOptions, ReconciliationEngine};

use mock_drive::MockDrive;

pub struct TestEnv {
    /// Keeps the temp tree alive for the test's duration.
    pub tmp: TempDir,
    pub local_root: PathBuf,
    pub store: Arc<StateStore>,
    pub drive: Arc<MockDrive>,
    pub sink: Arc<RecordingLogSink>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let local_root = tmp.path().join("local");
        std::fs::create_dir_all(&local_root).unwrap();

        let store = StateStore::new(&tmp.path().join("state.db"))
            .await
            .expect("state store");
        store.init_schema().await.expect("schema");

        Self {
            tmp,
            local_root,
            store: Arc::new(store),
            drive: Arc::new(MockDrive::new()),
            sink: Arc::new(RecordingLogSink::new()),
        }
    }

    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            local_root: self.local_root.clone(),
            remote_folder_token: String::new(),
            default_sync_direction: SyncDirection::RemoteWins,
            initial_sync_strategy: InitialSyncStrategy::LocalWins,
            remote_recycle_bin: "SyncRecycleBin".to_string(),
            local_trash_dir: ".sync_trash".to_string(),
            remote_delete_mode: RemoteDeleteMode::RecycleBin,
            cleanup_empty_remote_dirs: false,
            cleanup_remote_missing_dirs_recursive: false,
            exclude_dirs: vec![
                ".git".to_string(),
                ".sync_trash".to_string(),
                ".sync_quarantine".to_string(),
            ],
            exclude_hidden_dirs: true,
            exclude_hidden_files: true,
            max_retry: 5,
            scope_warning: None,
        }
    }

    pub fn engine(&self, opts: EngineOptions) -> ReconciliationEngine {
        ReconciliationEngine::new(
            opts,
            self.drive.clone(),
            self.store.clone(),
            self.sink.clone(),
        )
    }

    pub fn write_local(&self, rel: &str, content: &[u8]) {
        let path = self.local_root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read_local(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.local_root.join(rel)).unwrap()
    }

    pub fn local_exists(&self, rel: &str) -> bool {
        self.local_root.join(rel).exists()
    }

    /// Mark every retry row as immediately due.
    pub async fn make_retries_due(&self) {
        sqlx::query("UPDATE retry_queue SET next_retry_at = '2000-01-01T00:00:00'")
            .execute(self.store.pool())
            .await
            .unwrap();
    }
}

/// SHA-256 of a byte string, for assertions.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
