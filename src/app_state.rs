use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use crate::auth::FeishuAuth;
use crate::config::AppConfig;
use crate::feishu_service::{FeishuClient, RemoteDrive};
use crate::log_sink::{LogSink, ServiceLogSink};
use crate::persistency::StateStore;
use crate::run_history::RunHistory;

/// Shared component bundle every trigger and the engine hang off.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub store: Arc<StateStore>,
    pub auth: Arc<FeishuAuth>,
    pub drive: Arc<dyn RemoteDrive>,
    pub log_sink: Arc<dyn LogSink>,
    pub run_history: Arc<RunHistory>,
}

pub async fn app_state_factory(config_path: &Path) -> Result<AppState> {
    let config = AppConfig::load(config_path).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let store = StateStore::new(Path::new(&config.database.path))
        .await
        .context("Failed to open state store")?;
    store
        .init_schema()
        .await
        .context("Failed to initialize state store schema")?;

    let auth = Arc::new(FeishuAuth::new(&config.auth, config.auth_state_path()));
    let drive: Arc<dyn RemoteDrive> = Arc::new(FeishuClient::new(
        auth.clone(),
        config.auth.timeout_sec,
        config.sync.remote_folder_token.clone(),
    ));
    let log_sink: Arc<dyn LogSink> = Arc::new(ServiceLogSink::new(store.pool().clone()));
    let run_history = Arc::new(RunHistory::new(
        config.run_history_path(),
        config.last_run_path(),
    ));

    Ok(AppState {
        config: Arc::new(RwLock::new(config)),
        store: Arc::new(store),
        auth,
        drive,
        log_sink,
        run_history,
    })
}
