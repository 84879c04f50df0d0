//! Reconciliation engine and its run coordination
//!
//! [`SyncService`] is the single entry point every trigger goes through: it
//! owns the process-wide run lock, builds a fresh engine per run from the
//! current configuration, and records each summary to the run history.

pub mod engine;
pub mod retry;
pub mod strategies;
pub mod summary;

use log::warn;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{
    enforce_local_root_scope, AppConfig, InitialSyncStrategy, RemoteDeleteMode, SyncDirection,
};
use crate::feishu_service::RemoteDrive;
use crate::log_sink::LogSink;
use crate::persistency::StateStore;
use crate::run_history::RunHistory;
use crate::scanner::LocalScanner;
use crate::sync::engine::{EngineOptions, ReconciliationEngine};
use crate::sync::summary::RunSummary;

/// Explanatory note attached to dry-run summaries.
pub const DRY_RUN_NOTE: &str = "dry_run_skips_remote_operations";

/// Another trigger holds the run lock.
#[derive(Debug, Error)]
#[error("a sync run is already in progress")]
pub struct RunBusy;

pub struct SyncService {
    config: Arc<RwLock<AppConfig>>,
    store: Arc<StateStore>,
    drive: Arc<dyn RemoteDrive>,
    log: Arc<dyn LogSink>,
    history: Arc<RunHistory>,
    run_lock: tokio::sync::Mutex<()>,
}

impl SyncService {
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        store: Arc<StateStore>,
        drive: Arc<dyn RemoteDrive>,
        log: Arc<dyn LogSink>,
        history: Arc<RunHistory>,
    ) -> Self {
        Self {
            config,
            store,
            drive,
            log,
            history,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Non-blocking trigger: returns [`RunBusy`] when a run is in flight.
    pub async fn try_run(&self, run_type: &str) -> Result<RunSummary, RunBusy> {
        let _guard = self.run_lock.try_lock().map_err(|_| RunBusy)?;
        Ok(self.run_locked(run_type).await)
    }

    /// Blocking trigger with a bound: waits for the lock up to `timeout`.
    pub async fn run_with_lock_timeout(
        &self,
        timeout: Duration,
        run_type: &str,
    ) -> Result<RunSummary, RunBusy> {
        match tokio::time::timeout(timeout, self.run_lock.lock()).await {
            Ok(_guard) => Ok(self.run_locked(run_type).await),
            Err(_) => Err(RunBusy),
        }
    }

    /// Local-scan-only pass: counts local files, mutates neither side.
    pub async fn try_dry_run(&self) -> Result<RunSummary, RunBusy> {
        let _guard = self.run_lock.try_lock().map_err(|_| RunBusy)?;

        let (opts, _) = self.engine_options().await;
        let mut summary = RunSummary::new("manual");
        summary.local_root = opts.local_root.to_string_lossy().to_string();
        summary.scope_warning = opts.scope_warning.clone();
        summary.note = Some(DRY_RUN_NOTE.to_string());

        if let Ok(run_id) = self.store.sync_runs().insert_running("manual").await {
            summary.run_id = run_id;
        }

        let scanner = LocalScanner::new(
            &opts.local_root,
            &opts.exclude_dirs,
            opts.exclude_hidden_dirs,
            opts.exclude_hidden_files,
        );
        let snapshot = scanner.scan();
        summary.local_total = snapshot.files.len() as u64;
        summary.errors += snapshot.scan_errors;

        if summary.run_id > 0 {
            let json = serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string());
            let _ = self
                .store
                .sync_runs()
                .finish(summary.run_id, "success", &json)
                .await;
        }
        self.record(&summary);
        Ok(summary)
    }

    async fn run_locked(&self, run_type: &str) -> RunSummary {
        let (opts, _) = self.engine_options().await;
        let mut engine = ReconciliationEngine::new(
            opts,
            self.drive.clone(),
            self.store.clone(),
            self.log.clone(),
        );
        let summary = engine.run_once(run_type).await;
        self.record(&summary);
        summary
    }

    /// Engine options for the next run: YAML config, scope-clamped, with
    /// settings-table overrides merged on top.
    async fn engine_options(&self) -> (EngineOptions, AppConfig) {
        let mut cfg = self.config.read().await.clone();
        let (replaced, requested) = enforce_local_root_scope(&mut cfg);
        let mut opts = EngineOptions::from_sync_config(&cfg.sync);
        if replaced {
            warn!(
                "configured local root {:?} is out of scope, using the fixed root",
                requested
            );
            opts.scope_warning = Some(requested);
        }
        self.apply_settings_overrides(&mut opts).await;
        (opts, cfg)
    }

    async fn apply_settings_overrides(&self, opts: &mut EngineOptions) {
        let settings = self.store.settings();
        if let Ok(Some(value)) = settings.get("default_sync_direction").await {
            opts.default_sync_direction = SyncDirection::parse_lenient(&value);
        }
        if let Ok(Some(value)) = settings.get("initial_sync_strategy").await {
            opts.initial_sync_strategy = InitialSyncStrategy::parse_lenient(&value);
        }
        if let Ok(Some(value)) = settings.get("remote_delete_mode").await {
            opts.remote_delete_mode = RemoteDeleteMode::parse_lenient(&value);
        }
    }

    fn record(&self, summary: &RunSummary) {
        if let Err(e) = self.history.record(summary) {
            warn!("failed to record run summary: {:#}", e);
        }
    }
}
