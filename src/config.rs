//! Service configuration
//!
//! The whole service is configured by a single YAML document. Sections are
//! typed with serde defaults; unrecognized top-level keys are kept in a
//! sidecar map so a load/save round trip never drops them.

use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The only local root the engine is allowed to manage. Any other configured
/// value is replaced at run time and surfaced as a scope warning.
pub const FIXED_LOCAL_ROOT: &str = "/var/lib/feishu-sync/files";

/// Ongoing sync policy for mapped files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    RemoteWins,
    LocalWins,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::RemoteWins => "remote_wins",
            SyncDirection::LocalWins => "local_wins",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }

    /// Parse a raw settings string, falling back to `remote_wins`.
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "remote_wins" => SyncDirection::RemoteWins,
            "local_wins" => SyncDirection::LocalWins,
            "bidirectional" => SyncDirection::Bidirectional,
            other => {
                warn!("unknown sync direction {:?}, using remote_wins", other);
                SyncDirection::RemoteWins
            }
        }
    }
}

/// Source-of-truth choice for the very first run, when no mappings exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitialSyncStrategy {
    #[default]
    LocalWins,
    RemoteWins,
    DryRun,
}

impl InitialSyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitialSyncStrategy::LocalWins => "local_wins",
            InitialSyncStrategy::RemoteWins => "remote_wins",
            InitialSyncStrategy::DryRun => "dry_run",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "local_wins" => InitialSyncStrategy::LocalWins,
            "remote_wins" => InitialSyncStrategy::RemoteWins,
            "dry_run" => InitialSyncStrategy::DryRun,
            other => {
                warn!("unknown initial sync strategy {:?}, using local_wins", other);
                InitialSyncStrategy::LocalWins
            }
        }
    }
}

/// How remote items are removed when the local side wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteDeleteMode {
    #[default]
    RecycleBin,
    HardDelete,
}

impl RemoteDeleteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteDeleteMode::RecycleBin => "recycle_bin",
            RemoteDeleteMode::HardDelete => "hard_delete",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "recycle_bin" => RemoteDeleteMode::RecycleBin,
            "hard_delete" => RemoteDeleteMode::HardDelete,
            other => {
                warn!("unknown remote delete mode {:?}, using recycle_bin", other);
                RemoteDeleteMode::RecycleBin
            }
        }
    }
}

/// Application credentials and token handling for the Drive API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub app_id: String,
    pub app_secret: String,
    pub user_token_file: String,
    pub timeout_sec: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            user_token_file: String::new(),
            timeout_sec: 30,
        }
    }
}

fn default_poll_interval() -> u64 {
    300
}

fn default_recycle_bin() -> String {
    "SyncRecycleBin".to_string()
}

fn default_local_trash_dir() -> String {
    ".sync_trash".to_string()
}

fn default_exclude_dirs() -> Vec<String> {
    vec![
        ".git".to_string(),
        ".sync_trash".to_string(),
        ".sync_quarantine".to_string(),
        ".local_state".to_string(),
    ]
}

fn default_max_retry() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_event_debounce_sec() -> u64 {
    15
}

fn default_event_trigger_types() -> Vec<String> {
    vec!["drive.file.*".to_string()]
}

/// Reconciliation policy and trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub local_root: String,
    pub remote_folder_token: String,
    /// 0 disables the scheduler; positive values are seconds between runs.
    pub poll_interval_sec: u64,
    pub default_sync_direction: SyncDirection,
    pub initial_sync_strategy: InitialSyncStrategy,
    pub remote_recycle_bin: String,
    pub local_trash_dir: String,
    pub remote_delete_mode: RemoteDeleteMode,
    pub cleanup_empty_remote_dirs: bool,
    pub cleanup_remote_missing_dirs_recursive: bool,
    pub exclude_dirs: Vec<String>,
    pub exclude_hidden_dirs: bool,
    pub exclude_hidden_files: bool,
    pub max_retry: u32,
    pub event_callback_enabled: bool,
    pub event_verify_token: String,
    pub event_encrypt_key: String,
    pub event_debounce_sec: u64,
    pub event_trigger_types: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_root: FIXED_LOCAL_ROOT.to_string(),
            remote_folder_token: String::new(),
            poll_interval_sec: default_poll_interval(),
            default_sync_direction: SyncDirection::default(),
            initial_sync_strategy: InitialSyncStrategy::default(),
            remote_recycle_bin: default_recycle_bin(),
            local_trash_dir: default_local_trash_dir(),
            remote_delete_mode: RemoteDeleteMode::default(),
            cleanup_empty_remote_dirs: false,
            cleanup_remote_missing_dirs_recursive: false,
            exclude_dirs: default_exclude_dirs(),
            exclude_hidden_dirs: default_true(),
            exclude_hidden_files: default_true(),
            max_retry: default_max_retry(),
            event_callback_enabled: false,
            event_verify_token: String::new(),
            event_encrypt_key: String::new(),
            event_debounce_sec: default_event_debounce_sec(),
            event_trigger_types: default_event_trigger_types(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/var/lib/feishu-sync/runtime/service.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/feishu-sync/runtime/service.db".to_string(),
        }
    }
}

/// The whole YAML document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub auth: AuthConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    /// Unrecognized top-level keys, preserved across load/save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl AppConfig {
    /// Load from a YAML file, writing defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = AppConfig::default();
            cfg.save(path)?;
            return Ok(cfg);
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: AppConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?;
        Ok(cfg)
    }

    /// Full-rewrite save via a sibling temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let data = serde_yaml::to_string(self).context("Failed to serialize config")?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .context("Failed to create temp config file")?;
        tmp.write_all(data.as_bytes())?;
        tmp.persist(path)
            .map_err(|e| anyhow!("Failed to persist config file: {}", e))?;
        Ok(())
    }

    /// Reject configurations the service must not start with.
    pub fn validate(&self) -> Result<()> {
        if self.sync.poll_interval_sec > 86_400 {
            return Err(anyhow!(
                "sync.poll_interval_sec out of range: {}",
                self.sync.poll_interval_sec
            ));
        }
        if self.sync.event_callback_enabled && self.sync.event_verify_token.is_empty() {
            return Err(anyhow!(
                "sync.event_verify_token is required when event_callback_enabled is set"
            ));
        }
        Ok(())
    }

    /// Directory where the run history, last-run, and auth-state files live.
    pub fn runtime_dir(&self) -> PathBuf {
        PathBuf::from(&self.database.path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn run_history_path(&self) -> PathBuf {
        self.runtime_dir().join("run_history.jsonl")
    }

    pub fn last_run_path(&self) -> PathBuf {
        self.runtime_dir().join("last_run.json")
    }

    pub fn auth_state_path(&self) -> PathBuf {
        self.runtime_dir().join("auth_state.txt")
    }
}

/// Resolve symlinks and normalize a configured root for scope comparison.
fn normalize_local_root(value: &str) -> String {
    let raw = value.trim();
    if raw.is_empty() {
        return String::new();
    }
    let path = PathBuf::from(raw);
    match path.canonicalize() {
        Ok(resolved) => resolved.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

pub fn is_local_root_in_scope(value: &str) -> bool {
    normalize_local_root(value) == normalize_local_root(FIXED_LOCAL_ROOT)
}

/// Clamp the configured local root to the fixed path. Returns whether a
/// replacement happened together with the originally requested value.
pub fn enforce_local_root_scope(cfg: &mut AppConfig) -> (bool, String) {
    let requested = cfg.sync.local_root.clone();
    if !is_local_root_in_scope(&requested) {
        cfg.sync.local_root = FIXED_LOCAL_ROOT.to_string();
        return (true, requested);
    }
    // Keep a canonical value in memory to avoid path aliasing.
    cfg.sync.local_root = FIXED_LOCAL_ROOT.to_string();
    (false, requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.sync.poll_interval_sec, 300);
        assert_eq!(cfg.sync.default_sync_direction, SyncDirection::RemoteWins);
        assert_eq!(cfg.sync.initial_sync_strategy, InitialSyncStrategy::LocalWins);
        assert_eq!(cfg.sync.remote_delete_mode, RemoteDeleteMode::RecycleBin);
        assert_eq!(cfg.sync.remote_recycle_bin, "SyncRecycleBin");
        assert_eq!(cfg.sync.local_trash_dir, ".sync_trash");
        assert!(cfg.sync.exclude_hidden_dirs);
        assert!(cfg.sync.exclude_hidden_files);
        assert_eq!(cfg.sync.max_retry, 5);
    }

    #[test]
    fn lenient_parsers_fall_back() {
        assert_eq!(SyncDirection::parse_lenient("invalid"), SyncDirection::RemoteWins);
        assert_eq!(
            SyncDirection::parse_lenient("bidirectional"),
            SyncDirection::Bidirectional
        );
        assert_eq!(
            InitialSyncStrategy::parse_lenient("nope"),
            InitialSyncStrategy::LocalWins
        );
        assert_eq!(
            RemoteDeleteMode::parse_lenient("invalid"),
            RemoteDeleteMode::RecycleBin
        );
        assert_eq!(
            RemoteDeleteMode::parse_lenient("hard_delete"),
            RemoteDeleteMode::HardDelete
        );
    }

    #[test]
    fn load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let cfg = AppConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.sync.poll_interval_sec, 300);
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "sync:\n  poll_interval_sec: 60\ncustom_section:\n  hello: world\n",
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.sync.poll_interval_sec, 60);
        assert!(cfg.extra.contains_key("custom_section"));

        cfg.save(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("custom_section"));
        assert!(text.contains("hello: world"));
    }

    #[test]
    fn invalid_enum_value_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "sync:\n  default_sync_direction: sideways\n").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }

    #[test]
    fn validate_rejects_webhook_without_verify_token() {
        let mut cfg = AppConfig::default();
        cfg.sync.event_callback_enabled = true;
        cfg.sync.event_verify_token.clear();
        assert!(cfg.validate().is_err());

        cfg.sync.event_verify_token = "token".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn out_of_scope_root_is_replaced() {
        let mut cfg = AppConfig::default();
        cfg.sync.local_root = "/tmp/somewhere-else".to_string();
        let (replaced, requested) = enforce_local_root_scope(&mut cfg);
        assert!(replaced);
        assert_eq!(requested, "/tmp/somewhere-else");
        assert_eq!(cfg.sync.local_root, FIXED_LOCAL_ROOT);
    }

    #[test]
    fn in_scope_root_is_canonicalized() {
        let mut cfg = AppConfig::default();
        cfg.sync.local_root = FIXED_LOCAL_ROOT.to_string();
        let (replaced, _) = enforce_local_root_scope(&mut cfg);
        assert!(!replaced);
        assert_eq!(cfg.sync.local_root, FIXED_LOCAL_ROOT);
    }
}
