//! Reconciliation engine
//!
//! One run takes the current local and remote snapshots plus the stored
//! mappings, decides an action per entry, executes it, and updates state.
//! Per-entry failures are swallowed into counters and the retry queue; the
//! run always produces a summary. Only a failure that invalidates the rest
//! of the pass (no token, unreachable store) aborts with `fatal_error`.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{InitialSyncStrategy, RemoteDeleteMode, SyncConfig, SyncDirection};
use crate::feishu_service::feishu_models::KIND_FOLDER;
use crate::feishu_service::{RemoteDrive, RemoteError};
use crate::log_sink::{LogLevel, LogSink};
use crate::persistency::types::{FileMappingUpsert, MappingStatus, TombstoneSide};
use crate::persistency::{now_iso, StateStore};
use crate::scanner::local_scanner::sha256_file;
use crate::scanner::{LocalFile, LocalScanner, RemoteFile, RemoteTreeIndexer, safe_rel_path};
use crate::sync::retry::RetryPayload;
use crate::sync::strategies::{
    fingerprint_of, parse_timestamp, remote_fingerprint, resolve_both_changed,
    resolve_local_missing, resolve_remote_missing, SyncAction,
};
use crate::sync::summary::RunSummary;

/// Policy snapshot a run operates under.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub local_root: PathBuf,
    pub remote_folder_token: String,
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
    /// Set when the configured root was replaced by the fixed one.
    pub scope_warning: Option<String>,
}

impl EngineOptions {
    pub fn from_sync_config(sync: &SyncConfig) -> Self {
        let mut exclude_dirs = sync.exclude_dirs.clone();
        if !exclude_dirs.contains(&sync.local_trash_dir) {
            exclude_dirs.push(sync.local_trash_dir.clone());
        }
        Self {
            local_root: PathBuf::from(&sync.local_root),
            remote_folder_token: sync.remote_folder_token.clone(),
            default_sync_direction: sync.default_sync_direction,
            initial_sync_strategy: sync.initial_sync_strategy,
            remote_recycle_bin: sync.remote_recycle_bin.clone(),
            local_trash_dir: sync.local_trash_dir.clone(),
            remote_delete_mode: sync.remote_delete_mode,
            cleanup_empty_remote_dirs: sync.cleanup_empty_remote_dirs,
            cleanup_remote_missing_dirs_recursive: sync.cleanup_remote_missing_dirs_recursive,
            exclude_dirs,
            exclude_hidden_dirs: sync.exclude_hidden_dirs,
            exclude_hidden_files: sync.exclude_hidden_files,
            max_retry: sync.max_retry,
            scope_warning: None,
        }
    }
}

pub struct ReconciliationEngine {
    opts: EngineOptions,
    drive: Arc<dyn RemoteDrive>,
    store: Arc<StateStore>,
    log: Arc<dyn LogSink>,
    /// rel dir path -> remote folder token
    folder_cache: HashMap<String, String>,
    /// parent token -> child folder name -> token
    children_cache: HashMap<String, HashMap<String, String>>,
}

fn now_compact() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Whether an error (possibly wrapped) is a gone-class remote failure.
fn is_remote_gone(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RemoteError>()
        .map(RemoteError::is_gone)
        .unwrap_or(false)
}

fn file_name_of(rel: &str) -> String {
    rel.rsplit('/').next().unwrap_or(rel).to_string()
}

fn parent_rel_of(rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

impl ReconciliationEngine {
    pub fn new(
        opts: EngineOptions,
        drive: Arc<dyn RemoteDrive>,
        store: Arc<StateStore>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            opts,
            drive,
            store,
            log,
            folder_cache: HashMap::new(),
            children_cache: HashMap::new(),
        }
    }

    /// One full reconciliation pass. Never fails; a catastrophic error ends
    /// the pass early with `fatal_error` set.
    pub async fn run_once(&mut self, run_type: &str) -> RunSummary {
        let mut summary = RunSummary::new(run_type);
        summary.local_root = self.opts.local_root.to_string_lossy().to_string();
        summary.scope_warning = self.opts.scope_warning.clone();

        let run_id = match self.store.sync_runs().insert_running(run_type).await {
            Ok(id) => id,
            Err(e) => {
                summary.errors += 1;
                summary.fatal_error = format!("cannot open run record: {:#}", e);
                return summary;
            }
        };
        summary.run_id = run_id;

        match self.run_phases(&mut summary).await {
            Ok(()) => {
                let json = serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string());
                if let Err(e) = self.store.sync_runs().finish(run_id, "success", &json).await {
                    summary.errors += 1;
                    self.log.emit(
                        LogLevel::Error,
                        "sync",
                        "run_record_update_failed",
                        Some(&e.to_string()),
                    );
                }
                self.log
                    .emit(LogLevel::Info, "sync", "run_success", Some(&json));
            }
            Err(e) => {
                summary.errors += 1;
                summary.fatal_error = format!("{:#}", e);
                let json = serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string());
                let _ = self.store.sync_runs().finish(run_id, "failed", &json).await;
                self.log
                    .emit(LogLevel::Error, "sync", "run_failed", Some(&json));
            }
        }
        summary
    }

    async fn run_phases(&mut self, summary: &mut RunSummary) -> Result<()> {
        let root_token = if self.opts.remote_folder_token.is_empty() {
            self.drive
                .resolve_root()
                .await
                .context("failed to resolve remote root")?
        } else {
            self.opts.remote_folder_token.clone()
        };
        summary.remote_root_token = root_token.clone();

        // P0: drain due retries before planning anything new.
        self.drain_retries(&root_token, summary).await;

        fs::create_dir_all(&self.opts.local_root)
            .with_context(|| format!("cannot create local root {}", self.opts.local_root.display()))?;
        let scanner = LocalScanner::new(
            &self.opts.local_root,
            &self.opts.exclude_dirs,
            self.opts.exclude_hidden_dirs,
            self.opts.exclude_hidden_files,
        );
        let local = scanner.scan();
        summary.errors += local.scan_errors;
        summary.local_total = local.files.len() as u64;

        let drive = self.drive.clone();
        let recycle_name = self.opts.remote_recycle_bin.clone();
        let indexer = RemoteTreeIndexer::new(drive.as_ref(), &recycle_name);
        let mut remote = indexer
            .index(&root_token)
            .await
            .map_err(|e| anyhow!(e).context("failed to index remote tree"))?;
        summary.remote_total = remote.files.len() as u64;

        // P1: collapse same-name siblings, then re-index so downstream
        // phases see a unique namespace.
        match self.dedup_remote_same_name(&root_token).await {
            Ok(removed) => {
                if removed > 0 {
                    remote = indexer
                        .index(&root_token)
                        .await
                        .map_err(|e| anyhow!(e).context("failed to re-index after dedup"))?;
                    summary.remote_total = remote.files.len() as u64;
                }
            }
            Err(e) => {
                summary.errors += 1;
                self.log.emit(
                    LogLevel::Warn,
                    "sync",
                    "remote_dedup_failed",
                    Some(&e.to_string()),
                );
            }
        }

        self.folder_cache = remote.folders.clone();
        self.children_cache = remote.folder_children.clone();

        let mut local_files = local.files;
        let local_dirs = local.dirs;
        let mut remote_files = remote.files;

        // P2: mirror the local directory skeleton on the remote side.
        self.ensure_dir_skeleton(&root_token, &local_dirs, summary)
            .await;

        // P3: initial-sync guard.
        let mapping_count = self
            .store
            .file_mappings()
            .count_all()
            .await
            .context("cannot count mappings")?;
        if mapping_count == 0 {
            match self.opts.initial_sync_strategy {
                InitialSyncStrategy::LocalWins => {
                    remote_files.clear();
                    summary.remote_total = 0;
                }
                InitialSyncStrategy::RemoteWins => {
                    local_files.clear();
                    summary.local_total = 0;
                }
                InitialSyncStrategy::DryRun => {}
            }
        }

        // P4: rename detection.
        self.detect_renames(&local_files, &remote_files, summary)
            .await?;

        // P5: per-mapping reconciliation.
        self.reconcile_mappings(&root_token, &local_files, &remote_files, summary)
            .await?;

        // P6: local files nobody maps yet.
        self.discover_new_local(&root_token, &local_files, &remote_files, summary)
            .await?;

        // P7: remote files nobody maps yet.
        self.discover_new_remote(&local_files, &remote_files, summary)
            .await?;

        // P8: optional remote directory cleanup.
        if self.opts.cleanup_empty_remote_dirs {
            self.cleanup_remote_dirs(&root_token, &local_dirs, summary)
                .await;
        }

        Ok(())
    }

    // --- P0 -------------------------------------------------------------

    async fn drain_retries(&mut self, root_token: &str, summary: &mut RunSummary) {
        let repo = self.store.retry_queue();
        let rows = match repo.due().await {
            Ok(rows) => rows,
            Err(e) => {
                summary.errors += 1;
                self.log.emit(
                    LogLevel::Error,
                    "retry",
                    "retry_queue_read_failed",
                    Some(&e.to_string()),
                );
                return;
            }
        };

        for row in rows {
            let payload = match RetryPayload::from_json(&row.payload_json) {
                Ok(payload) => payload,
                Err(_) => {
                    // Unknown opcode: programmer error, drop the row.
                    let _ = repo.remove(row.id).await;
                    self.log.emit(
                        LogLevel::Error,
                        "retry",
                        "retry_unknown_kind",
                        Some(&row.payload_json),
                    );
                    continue;
                }
            };

            if payload.targets_internal_path(&self.opts.local_trash_dir) {
                let _ = repo.remove(row.id).await;
                self.log.emit(
                    LogLevel::Warn,
                    "retry",
                    "retry_skip_local_internal",
                    payload.rel_path(),
                );
                continue;
            }

            match self.execute_retry_payload(&payload, root_token).await {
                Ok(()) => {
                    if let Err(e) = repo.remove(row.id).await {
                        summary.errors += 1;
                        self.log.emit(
                            LogLevel::Error,
                            "retry",
                            "retry_row_remove_failed",
                            Some(&e.to_string()),
                        );
                    }
                    summary.retry_success += 1;
                }
                Err(e) if is_remote_gone(&e) => {
                    // Remote resource vanished for good: tombstone, drop.
                    let (rel, token) = match &payload {
                        RetryPayload::Pull { rel_path, remote_item } => {
                            (Some(rel_path.as_str()), Some(remote_item.token.as_str()))
                        }
                        RetryPayload::DeleteRemote { remote_token, .. } => {
                            (None, Some(remote_token.as_str()))
                        }
                        other => (other.rel_path(), None),
                    };
                    let _ = self
                        .store
                        .tombstones()
                        .insert(TombstoneSide::Remote, rel, token, "retry_remote_404")
                        .await;
                    let _ = repo.remove(row.id).await;
                    summary.retry_failed += 1;
                }
                Err(e) => {
                    let err_text = format!("{:#}", e);
                    match repo
                        .reschedule_failure(&row, &err_text, self.opts.max_retry)
                        .await
                    {
                        Ok(_discarded) => {}
                        Err(db_err) => {
                            summary.errors += 1;
                            self.log.emit(
                                LogLevel::Error,
                                "retry",
                                "retry_reschedule_failed",
                                Some(&db_err.to_string()),
                            );
                        }
                    }
                    summary.retry_failed += 1;
                    self.log
                        .emit(LogLevel::Error, "retry", "retry_failed", Some(&err_text));
                }
            }
        }
    }

    async fn execute_retry_payload(
        &mut self,
        payload: &RetryPayload,
        root_token: &str,
    ) -> Result<()> {
        match payload {
            RetryPayload::Upload { rel_path } => {
                let full = self.opts.local_root.join(rel_path);
                if !full.exists() {
                    return Err(anyhow!("local file for retried upload missing: {}", rel_path));
                }
                self.upload_local_file(rel_path, root_token, None).await?;
                Ok(())
            }
            RetryPayload::Pull { rel_path, remote_item } => {
                self.pull_remote_to_local(rel_path, remote_item).await
            }
            RetryPayload::DeleteRemote {
                remote_token,
                remote_type,
            } => {
                self.delete_remote(remote_token, remote_type, root_token)
                    .await
                    .map(|_| ())
            }
            RetryPayload::DeleteLocal { rel_path } => self.soft_delete_local(rel_path),
        }
    }

    // --- P1 -------------------------------------------------------------

    /// Hard-delete same-name siblings, keeping the newest by modified time.
    /// Ties are broken by the lexicographically smallest token, which is
    /// deterministic across platforms. Returns how many items were removed.
    async fn dedup_remote_same_name(&mut self, root_token: &str) -> Result<u64> {
        let mut removed = 0u64;
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root_token.to_string());
        let mut stack: Vec<String> = vec![root_token.to_string()];

        while let Some(folder_token) = stack.pop() {
            let children = match self.drive.list_children(&folder_token).await {
                Ok(children) => children,
                // Folder deleted underneath us between listing and descent.
                Err(e) if e.is_gone() => continue,
                Err(e) => return Err(anyhow!(e).context("dedup listing failed")),
            };

            let mut groups: BTreeMap<String, Vec<_>> = BTreeMap::new();
            for item in children {
                if item.name.is_empty() {
                    continue;
                }
                groups.entry(item.name.clone()).or_default().push(item);
            }

            let mut deleted_tokens: HashSet<String> = HashSet::new();
            for (name, mut items) in groups.clone() {
                if items.len() <= 1 {
                    continue;
                }
                items.sort_by(|a, b| {
                    parse_timestamp(&b.modified_time)
                        .partial_cmp(&parse_timestamp(&a.modified_time))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.token.cmp(&b.token))
                });
                for victim in &items[1..] {
                    match self.drive.hard_delete(&victim.token, &victim.kind).await {
                        Ok(()) | Err(RemoteError::Gone(_)) => {
                            deleted_tokens.insert(victim.token.clone());
                            removed += 1;
                            self.log.emit(
                                LogLevel::Warn,
                                "sync",
                                "remote_dedup_deleted",
                                Some(&format!(
                                    "{{\"name\":{:?},\"token\":{:?},\"type\":{:?}}}",
                                    name, victim.token, victim.kind
                                )),
                            );
                        }
                        Err(e) => return Err(anyhow!(e).context("dedup delete failed")),
                    }
                }
            }

            for (_, items) in groups {
                for item in items {
                    if item.is_folder()
                        && !deleted_tokens.contains(&item.token)
                        && visited.insert(item.token.clone())
                    {
                        stack.push(item.token);
                    }
                }
            }
        }

        Ok(removed)
    }

    // --- P2 -------------------------------------------------------------

    async fn ensure_dir_skeleton(
        &mut self,
        root_token: &str,
        local_dirs: &[String],
        summary: &mut RunSummary,
    ) {
        for rel_dir in local_dirs {
            match self.ensure_remote_folder(root_token, rel_dir).await {
                Ok(folder_token) => {
                    if let Err(e) = self
                        .store
                        .folder_mappings()
                        .upsert(rel_dir, &folder_token)
                        .await
                    {
                        summary.errors += 1;
                        self.log.emit(
                            LogLevel::Error,
                            "sync",
                            "folder_mapping_write_failed",
                            Some(&e.to_string()),
                        );
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    self.log.emit(
                        LogLevel::Error,
                        "sync",
                        "ensure_remote_folder_failed",
                        Some(&format!("{{\"dir\":{:?},\"error\":{:?}}}", rel_dir, e.to_string())),
                    );
                }
            }
        }
    }

    /// Resolve (creating as needed) the remote folder for a relative
    /// directory, walking down from the root and caching every step.
    async fn ensure_remote_folder(&mut self, root_token: &str, rel_dir: &str) -> Result<String> {
        let rel_dir = safe_rel_path(rel_dir);
        if rel_dir.is_empty() || rel_dir == "." {
            return Ok(root_token.to_string());
        }
        if let Some(token) = self.folder_cache.get(&rel_dir) {
            return Ok(token.clone());
        }

        let mut current = root_token.to_string();
        let mut current_rel = String::new();
        for part in rel_dir.split('/').filter(|p| !p.is_empty()) {
            current_rel = if current_rel.is_empty() {
                part.to_string()
            } else {
                format!("{}/{}", current_rel, part)
            };
            if let Some(token) = self.folder_cache.get(&current_rel) {
                current = token.clone();
                continue;
            }

            let found = match self.find_child_folder(&current, part).await? {
                Some(token) => token,
                None => {
                    let created = self
                        .drive
                        .create_folder(&current, part)
                        .await
                        .map_err(|e| anyhow!(e).context("create_folder failed"))?;
                    self.children_cache
                        .entry(current.clone())
                        .or_default()
                        .insert(part.to_string(), created.clone());
                    created
                }
            };

            self.folder_cache.insert(current_rel.clone(), found.clone());
            current = found;
        }

        Ok(current)
    }

    async fn find_child_folder(&mut self, parent_token: &str, name: &str) -> Result<Option<String>> {
        if let Some(children) = self.children_cache.get(parent_token) {
            if let Some(token) = children.get(name) {
                return Ok(Some(token.clone()));
            }
            return Ok(None);
        }

        let children = self
            .drive
            .list_children(parent_token)
            .await
            .map_err(|e| anyhow!(e).context("list_children failed"))?;
        let mut folder_map = HashMap::new();
        for item in children {
            if item.is_folder() {
                folder_map.insert(item.name.clone(), item.token.clone());
            }
        }
        let found = folder_map.get(name).cloned();
        self.children_cache
            .insert(parent_token.to_string(), folder_map);
        Ok(found)
    }

    async fn ensure_recycle_bin(&mut self, root_token: &str) -> Result<String> {
        let name = self.opts.remote_recycle_bin.clone();
        if let Some(token) = self.folder_cache.get(&name) {
            return Ok(token.clone());
        }

        let token = match self.find_child_folder(root_token, &name).await? {
            Some(token) => token,
            None => self
                .drive
                .create_folder(root_token, &name)
                .await
                .map_err(|e| anyhow!(e).context("create recycle bin failed"))?,
        };
        self.folder_cache.insert(name, token.clone());
        Ok(token)
    }

    // --- P4 -------------------------------------------------------------

    /// A mapping whose local file vanished, whose remote survives, and whose
    /// stored hash matches exactly one unmapped local file is a rename:
    /// rewrite the mapping and rename the remote side to follow.
    async fn detect_renames(
        &mut self,
        local_files: &BTreeMap<String, LocalFile>,
        remote_files: &[RemoteFile],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mappings = self
            .store
            .file_mappings()
            .load_live()
            .await
            .context("cannot load mappings")?;
        let mapped_paths: HashSet<&str> =
            mappings.iter().map(|m| m.local_rel_path.as_str()).collect();
        let remote_by_token: HashMap<&str, &RemoteFile> =
            remote_files.iter().map(|r| (r.token.as_str(), r)).collect();

        let mut unmapped_by_hash: HashMap<&str, Vec<&str>> = HashMap::new();
        for (rel, info) in local_files {
            if !mapped_paths.contains(rel.as_str()) {
                unmapped_by_hash
                    .entry(info.hash.as_str())
                    .or_default()
                    .push(rel);
            }
        }

        for mapping in &mappings {
            if local_files.contains_key(&mapping.local_rel_path) || mapping.local_hash.is_empty() {
                continue;
            }
            let Some(remote_item) = remote_by_token.get(mapping.remote_token.as_str()) else {
                continue;
            };
            let Some(candidates) = unmapped_by_hash.get_mut(mapping.local_hash.as_str()) else {
                continue;
            };
            if candidates.len() != 1 {
                continue;
            }
            let new_rel = candidates.remove(0).to_string();

            self.store
                .file_mappings()
                .rename_path(&mapping.local_rel_path, &new_rel)
                .await
                .context("cannot rewrite mapping path")?;

            let new_name = file_name_of(&new_rel);
            if new_name != remote_item.name {
                if let Err(e) = self.drive.rename(&remote_item.token, &new_name).await {
                    // Keep the mapping change; the next pass retries.
                    summary.errors += 1;
                    self.log.emit(
                        LogLevel::Warn,
                        "sync",
                        "remote_rename_failed",
                        Some(&e.to_string()),
                    );
                }
            }
            summary.renamed += 1;
            self.log.emit(
                LogLevel::Info,
                "sync",
                "local_rename_detected",
                Some(&format!(
                    "{{\"old\":{:?},\"new\":{:?}}}",
                    mapping.local_rel_path, new_rel
                )),
            );
        }
        Ok(())
    }

    // --- P5 -------------------------------------------------------------

    async fn reconcile_mappings(
        &mut self,
        root_token: &str,
        local_files: &BTreeMap<String, LocalFile>,
        remote_files: &[RemoteFile],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let direction = self.opts.default_sync_direction;
        let mappings = self
            .store
            .file_mappings()
            .load_live()
            .await
            .context("cannot load mappings")?;
        let remote_by_token: HashMap<String, RemoteFile> = remote_files
            .iter()
            .map(|r| (r.token.clone(), r.clone()))
            .collect();

        for mapping in mappings {
            let rel = mapping.local_rel_path.clone();
            let local_item = local_files.get(&rel);
            let remote_item = remote_by_token.get(&mapping.remote_token);

            match (local_item, remote_item) {
                (None, Some(remote)) => {
                    match resolve_local_missing(direction, &mapping.remote_hash, remote) {
                        SyncAction::PullRemote => {
                            self.try_pull(&rel, remote, summary).await;
                        }
                        _ => {
                            // The user removed the local side; the remote
                            // follows. The tombstone reason marks that this
                            // is an assumption, not an observed delete.
                            match self.delete_remote(&remote.token, &remote.kind, root_token).await
                            {
                                Ok(mode) => {
                                    self.count_remote_delete(mode, summary);
                                    let _ = self
                                        .store
                                        .tombstones()
                                        .insert(
                                            TombstoneSide::Local,
                                            Some(&rel),
                                            Some(&remote.token),
                                            "local_missing_assumed_deleted",
                                        )
                                        .await;
                                    self.store
                                        .file_mappings()
                                        .mark_deleted(&rel)
                                        .await
                                        .context("cannot mark mapping deleted")?;
                                }
                                Err(e) => {
                                    self.enqueue_retry(
                                        RetryPayload::DeleteRemote {
                                            remote_token: remote.token.clone(),
                                            remote_type: remote.kind.clone(),
                                        },
                                        &e,
                                        summary,
                                    )
                                    .await;
                                }
                            }
                        }
                    }
                }
                (Some(local), None) => {
                    match resolve_remote_missing(direction, &mapping.local_hash, &local.hash) {
                        SyncAction::UploadLocal => {
                            self.try_upload(&rel, root_token, None, summary).await;
                        }
                        _ => match self.soft_delete_local(&rel) {
                            Ok(()) => {
                                let _ = self
                                    .store
                                    .tombstones()
                                    .insert(
                                        TombstoneSide::Remote,
                                        Some(&rel),
                                        Some(&mapping.remote_token),
                                        "remote_deleted",
                                    )
                                    .await;
                                self.store
                                    .file_mappings()
                                    .mark_deleted(&rel)
                                    .await
                                    .context("cannot mark mapping deleted")?;
                                summary.local_soft_deleted += 1;
                            }
                            Err(e) => {
                                self.enqueue_retry(
                                    RetryPayload::DeleteLocal { rel_path: rel.clone() },
                                    &e,
                                    summary,
                                )
                                .await;
                            }
                        },
                    }
                }
                (None, None) => {
                    // Both gone: record which side acted last, close the row.
                    let side = if mapping.local_mtime
                        > parse_timestamp(&mapping.remote_modified_time)
                    {
                        TombstoneSide::Local
                    } else {
                        TombstoneSide::Remote
                    };
                    let _ = self
                        .store
                        .tombstones()
                        .insert(side, Some(&rel), Some(&mapping.remote_token), "both_missing")
                        .await;
                    self.store
                        .file_mappings()
                        .mark_deleted(&rel)
                        .await
                        .context("cannot mark mapping deleted")?;
                }
                (Some(local), Some(remote)) => {
                    let local_changed = local.hash != mapping.local_hash;
                    let remote_changed = fingerprint_of(remote) != mapping.remote_hash;

                    if !local_changed && !remote_changed {
                        continue;
                    }
                    let action = if local_changed && !remote_changed {
                        SyncAction::UploadLocal
                    } else if remote_changed && !local_changed {
                        SyncAction::PullRemote
                    } else {
                        resolve_both_changed(direction, local.mtime, &remote.modified_time)
                    };

                    match action {
                        SyncAction::UploadLocal => {
                            self.try_upload(
                                &rel,
                                root_token,
                                Some((mapping.remote_token.clone(), mapping.remote_type.clone())),
                                summary,
                            )
                            .await;
                        }
                        _ => {
                            self.try_pull(&rel, remote, summary).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- P6 -------------------------------------------------------------

    async fn discover_new_local(
        &mut self,
        root_token: &str,
        local_files: &BTreeMap<String, LocalFile>,
        remote_files: &[RemoteFile],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mappings = self
            .store
            .file_mappings()
            .load_live()
            .await
            .context("cannot load mappings")?;
        let mapped_paths: HashSet<String> =
            mappings.iter().map(|m| m.local_rel_path.clone()).collect();
        let mapped_tokens: HashSet<String> = mappings
            .iter()
            .filter(|m| !m.remote_token.is_empty())
            .map(|m| m.remote_token.clone())
            .collect();
        let remote_by_path: HashMap<&str, &RemoteFile> =
            remote_files.iter().map(|r| (r.path.as_str(), r)).collect();

        for (rel, local) in local_files {
            if mapped_paths.contains(rel) {
                continue;
            }
            // A file from the snapshot can be gone by now, trashed by an
            // earlier phase of this same run.
            if !self.opts.local_root.join(rel).exists() {
                continue;
            }

            if let Some(remote) = remote_by_path.get(rel.as_str()) {
                if !mapped_tokens.contains(&remote.token) {
                    self.handle_path_conflict(rel, local, remote, summary).await;
                    continue;
                }
            }

            self.try_upload(rel, root_token, None, summary).await;
        }
        Ok(())
    }

    // --- P7 -------------------------------------------------------------

    async fn discover_new_remote(
        &mut self,
        local_files: &BTreeMap<String, LocalFile>,
        remote_files: &[RemoteFile],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mappings = self
            .store
            .file_mappings()
            .load_live()
            .await
            .context("cannot load mappings")?;
        let mapped_paths: HashSet<String> =
            mappings.iter().map(|m| m.local_rel_path.clone()).collect();
        let mapped_tokens: HashSet<String> = mappings
            .iter()
            .filter(|m| !m.remote_token.is_empty())
            .map(|m| m.remote_token.clone())
            .collect();

        for remote in remote_files {
            if mapped_tokens.contains(&remote.token) {
                continue;
            }
            let rel = safe_rel_path(&remote.path);
            if mapped_paths.contains(&rel) {
                continue;
            }

            if let Some(local) = local_files.get(&rel) {
                self.handle_path_conflict(&rel, local, remote, summary).await;
                continue;
            }

            match self.pull_remote_to_local(&rel, remote).await {
                Ok(()) => summary.downloaded += 1,
                Err(e) if is_remote_gone(&e) => {
                    let _ = self
                        .store
                        .tombstones()
                        .insert(TombstoneSide::Remote, Some(&rel), Some(&remote.token), "remote_404")
                        .await;
                }
                Err(e) => {
                    self.enqueue_retry(
                        RetryPayload::Pull {
                            rel_path: rel.clone(),
                            remote_item: remote.clone(),
                        },
                        &e,
                        summary,
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Same path exists on both sides with no mapping tying them together:
    /// keep both. The remote bytes land next to the local file as a
    /// conflict copy and the mapping is created in conflict state.
    async fn handle_path_conflict(
        &mut self,
        rel: &str,
        local: &LocalFile,
        remote: &RemoteFile,
        summary: &mut RunSummary,
    ) {
        match self.create_conflict_copy(rel, remote).await {
            Ok(()) => {
                let upsert = FileMappingUpsert {
                    local_rel_path: rel.to_string(),
                    remote_token: remote.token.clone(),
                    remote_type: remote.kind.clone(),
                    local_hash: local.hash.clone(),
                    remote_hash: fingerprint_of(remote),
                    local_mtime: local.mtime,
                    remote_modified_time: remote.modified_time.clone(),
                    status: MappingStatus::Conflict,
                    conflict: true,
                };
                match self.store.file_mappings().upsert(&upsert).await {
                    Ok(()) => summary.conflicts += 1,
                    Err(e) => {
                        summary.errors += 1;
                        self.log.emit(
                            LogLevel::Error,
                            "sync",
                            "conflict_mapping_write_failed",
                            Some(&e.to_string()),
                        );
                    }
                }
            }
            Err(e) => {
                self.enqueue_retry(
                    RetryPayload::Pull {
                        rel_path: format!("{}.remote_conflict_retry", rel),
                        remote_item: remote.clone(),
                    },
                    &e,
                    summary,
                )
                .await;
            }
        }
    }

    // --- P8 -------------------------------------------------------------

    /// Remove remote folders with no local counterpart. Empty folders go
    /// whenever cleanup is enabled; non-empty trees only with the recursive
    /// flag. The recycle folder and the root are never touched.
    async fn cleanup_remote_dirs(
        &mut self,
        root_token: &str,
        local_dirs: &[String],
        summary: &mut RunSummary,
    ) {
        let drive = self.drive.clone();
        let recycle_name = self.opts.remote_recycle_bin.clone();
        let indexer = RemoteTreeIndexer::new(drive.as_ref(), &recycle_name);
        let snapshot = match indexer.index(root_token).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                summary.errors += 1;
                self.log.emit(
                    LogLevel::Error,
                    "sync",
                    "cleanup_index_failed",
                    Some(&e.to_string()),
                );
                return;
            }
        };

        let local_dir_set: HashSet<&str> = local_dirs.iter().map(|d| d.as_str()).collect();
        let recycle_prefix = format!("{}/", self.opts.remote_recycle_bin);

        // Deepest first, so emptied parents cascade within one pass.
        let mut folders: Vec<(&String, &String)> = snapshot.folders.iter().collect();
        folders.sort_by_key(|(path, _)| std::cmp::Reverse(path.matches('/').count()));

        for (path, token) in folders {
            if path.is_empty()
                || path.as_str() == self.opts.remote_recycle_bin
                || path.starts_with(&recycle_prefix)
                || local_dir_set.contains(path.as_str())
            {
                continue;
            }

            let children = match self.drive.list_children(token).await {
                Ok(children) => children,
                Err(e) if e.is_gone() => continue,
                Err(e) => {
                    summary.errors += 1;
                    self.log.emit(
                        LogLevel::Error,
                        "sync",
                        "cleanup_list_failed",
                        Some(&e.to_string()),
                    );
                    continue;
                }
            };

            if children.is_empty() {
                match self.delete_remote(token, KIND_FOLDER, root_token).await {
                    Ok(mode) => {
                        self.count_remote_delete(mode, summary);
                        summary.remote_empty_dirs_deleted += 1;
                        summary.remote_dirs_deleted += 1;
                        let _ = self.store.folder_mappings().delete_by_token(token).await;
                    }
                    Err(e) => {
                        summary.errors += 1;
                        self.log.emit(
                            LogLevel::Error,
                            "sync",
                            "cleanup_delete_failed",
                            Some(&e.to_string()),
                        );
                    }
                }
            } else if self.opts.cleanup_remote_missing_dirs_recursive {
                match self.delete_remote_tree(token, root_token, summary).await {
                    Ok(()) => {
                        summary.remote_dirs_recursive_deleted += 1;
                        let _ = self.store.folder_mappings().delete_by_token(token).await;
                    }
                    Err(e) => {
                        summary.errors += 1;
                        self.log.emit(
                            LogLevel::Error,
                            "sync",
                            "cleanup_recursive_delete_failed",
                            Some(&e.to_string()),
                        );
                    }
                }
            }
        }
    }

    /// Depth-first removal of a folder and everything under it, files
    /// before folders, each deletion honoring the delete mode.
    fn delete_remote_tree<'a>(
        &'a mut self,
        folder_token: &'a str,
        root_token: &'a str,
        summary: &'a mut RunSummary,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let children = match self.drive.list_children(folder_token).await {
                Ok(children) => children,
                Err(e) if e.is_gone() => return Ok(()),
                Err(e) => return Err(anyhow!(e).context("recursive cleanup listing failed")),
            };

            for item in children {
                if item.is_folder() {
                    self.delete_remote_tree(&item.token, root_token, summary)
                        .await?;
                } else {
                    let mode = self.delete_remote(&item.token, &item.kind, root_token).await?;
                    self.count_remote_delete(mode, summary);
                }
            }

            let mode = self
                .delete_remote(folder_token, KIND_FOLDER, root_token)
                .await?;
            self.count_remote_delete(mode, summary);
            summary.remote_dirs_deleted += 1;
            Ok(())
        })
    }

    // --- shared operations ----------------------------------------------

    async fn try_pull(&mut self, rel: &str, remote: &RemoteFile, summary: &mut RunSummary) {
        match self.pull_remote_to_local(rel, remote).await {
            Ok(()) => summary.downloaded += 1,
            Err(e) if is_remote_gone(&e) => {
                let _ = self
                    .store
                    .tombstones()
                    .insert(TombstoneSide::Remote, Some(rel), Some(&remote.token), "remote_404")
                    .await;
            }
            Err(e) => {
                self.enqueue_retry(
                    RetryPayload::Pull {
                        rel_path: rel.to_string(),
                        remote_item: remote.clone(),
                    },
                    &e,
                    summary,
                )
                .await;
            }
        }
    }

    async fn try_upload(
        &mut self,
        rel: &str,
        root_token: &str,
        old_remote: Option<(String, String)>,
        summary: &mut RunSummary,
    ) {
        let old = old_remote
            .as_ref()
            .map(|(token, kind)| (token.as_str(), kind.as_str()));
        match self.upload_local_file(rel, root_token, old).await {
            Ok(()) => summary.uploaded += 1,
            Err(e) => {
                self.enqueue_retry(
                    RetryPayload::Upload { rel_path: rel.to_string() },
                    &e,
                    summary,
                )
                .await;
            }
        }
    }

    async fn enqueue_retry<E: std::fmt::Display>(
        &mut self,
        payload: RetryPayload,
        error: &E,
        summary: &mut RunSummary,
    ) {
        summary.errors += 1;
        let json = match payload.to_json() {
            Ok(json) => json,
            Err(e) => {
                self.log.emit(
                    LogLevel::Error,
                    "retry",
                    "retry_payload_serialize_failed",
                    Some(&e.to_string()),
                );
                return;
            }
        };
        if let Err(e) = self
            .store
            .retry_queue()
            .enqueue(payload.op_type(), &json, &error.to_string(), 0)
            .await
        {
            self.log.emit(
                LogLevel::Error,
                "retry",
                "retry_enqueue_failed",
                Some(&e.to_string()),
            );
        }
    }

    /// Upload a local file, confirm the new remote id, then retire the old
    /// one. The order guarantees the remote never loses both copies.
    async fn upload_local_file(
        &mut self,
        rel: &str,
        root_token: &str,
        old_remote: Option<(&str, &str)>,
    ) -> Result<()> {
        let rel = safe_rel_path(rel);
        let local_file = self.opts.local_root.join(&rel);
        let parent_rel = parent_rel_of(&rel);
        let folder_token = self.ensure_remote_folder(root_token, &parent_rel).await?;
        let name = file_name_of(&rel);

        let uploaded = self
            .drive
            .upload(&folder_token, &name, &local_file)
            .await
            .map_err(|e| anyhow!(e).context("upload failed"))?;

        let metadata = fs::metadata(&local_file)
            .with_context(|| format!("cannot stat {}", local_file.display()))?;
        let mut remote_kind = "file".to_string();
        let mut remote_size = metadata.len();
        let mut remote_modified = now_iso();
        // Best effort: read back the server's own metadata for the
        // fingerprint, so the next pass sees the file as unchanged.
        if let Ok(children) = self.drive.list_children(&folder_token).await {
            if let Some(hit) = children.iter().find(|c| c.token == uploaded.file_token) {
                remote_kind = hit.kind.clone();
                if hit.size > 0 {
                    remote_size = hit.size;
                }
                if !hit.modified_time.is_empty() {
                    remote_modified = hit.modified_time.clone();
                }
            }
        }

        if let Some((old_token, old_kind)) = old_remote {
            if old_token != uploaded.file_token {
                if let Err(e) = self.delete_remote(old_token, old_kind, root_token).await {
                    self.log.emit(
                        LogLevel::Warn,
                        "sync",
                        "old_remote_retire_failed",
                        Some(&e.to_string()),
                    );
                }
            }
        }

        let local_hash =
            sha256_file(&local_file).with_context(|| format!("cannot hash {}", rel))?;
        let local_mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        self.store
            .file_mappings()
            .upsert(&FileMappingUpsert {
                local_rel_path: rel,
                remote_token: uploaded.file_token,
                remote_type: remote_kind,
                local_hash,
                remote_hash: remote_fingerprint(&remote_modified, remote_size),
                local_mtime,
                remote_modified_time: remote_modified,
                status: MappingStatus::Active,
                conflict: false,
            })
            .await
            .context("cannot store mapping after upload")?;
        Ok(())
    }

    /// Download into a sibling temp file, then rename over the destination.
    /// An interrupted download leaves the destination untouched.
    async fn pull_remote_to_local(&mut self, rel: &str, remote: &RemoteFile) -> Result<()> {
        let rel = safe_rel_path(rel);
        let dest = self.opts.local_root.join(&rel);
        let parent = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.opts.local_root.clone());
        fs::create_dir_all(&parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;

        // Same directory as the destination, so the final rename is atomic.
        let tmp = tempfile::NamedTempFile::new_in(&parent)
            .context("cannot create temp download file")?;
        let tmp_path = tmp.into_temp_path();

        self.drive.download(&remote.token, &tmp_path).await?;
        tmp_path
            .persist(&dest)
            .with_context(|| format!("cannot move download into {}", dest.display()))?;

        let local_hash = sha256_file(&dest).with_context(|| format!("cannot hash {}", rel))?;
        let local_mtime = fs::metadata(&dest)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        self.store
            .file_mappings()
            .upsert(&FileMappingUpsert {
                local_rel_path: rel,
                remote_token: remote.token.clone(),
                remote_type: remote.kind.clone(),
                local_hash,
                remote_hash: fingerprint_of(remote),
                local_mtime,
                remote_modified_time: remote.modified_time.clone(),
                status: MappingStatus::Active,
                conflict: false,
            })
            .await
            .context("cannot store mapping after pull")?;
        Ok(())
    }

    /// Download the remote bytes next to the local file as
    /// `<name>.remote_conflict_<timestamp>`.
    async fn create_conflict_copy(&mut self, rel: &str, remote: &RemoteFile) -> Result<()> {
        let rel = safe_rel_path(rel);
        let base = self.opts.local_root.join(&rel);
        let parent = base
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.opts.local_root.clone());
        fs::create_dir_all(&parent)?;

        let conflict_path = parent.join(format!(
            "{}.remote_conflict_{}",
            file_name_of(&rel),
            now_compact()
        ));
        self.drive.download(&remote.token, &conflict_path).await?;
        Ok(())
    }

    /// Move a local file into the dated trash directory under the root.
    fn soft_delete_local(&self, rel: &str) -> Result<()> {
        let rel = safe_rel_path(rel);
        let src = self.opts.local_root.join(&rel);
        if !src.exists() {
            return Ok(());
        }

        let dest = self
            .opts
            .local_root
            .join(&self.opts.local_trash_dir)
            .join(now_compact())
            .join(&rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create trash dir {}", parent.display()))?;
        }
        if fs::rename(&src, &dest).is_err() {
            // Rename can fail across mount points inside the root; fall
            // back to copy-then-remove.
            fs::copy(&src, &dest)
                .with_context(|| format!("cannot copy {} to trash", src.display()))?;
            fs::remove_file(&src)
                .with_context(|| format!("cannot remove {}", src.display()))?;
        }
        Ok(())
    }

    /// Apply the configured delete mode to one remote item. Returns the
    /// mode actually applied so callers can count it.
    async fn delete_remote(
        &mut self,
        remote_token: &str,
        remote_type: &str,
        root_token: &str,
    ) -> Result<RemoteDeleteMode> {
        match self.opts.remote_delete_mode {
            RemoteDeleteMode::HardDelete => {
                self.drive
                    .hard_delete(remote_token, remote_type)
                    .await
                    .map_err(|e| anyhow!(e).context("hard delete failed"))?;
                Ok(RemoteDeleteMode::HardDelete)
            }
            RemoteDeleteMode::RecycleBin => {
                let recycle_token = self.ensure_recycle_bin(root_token).await?;
                self.drive
                    .move_item(remote_token, remote_type, &recycle_token)
                    .await
                    .map_err(|e| anyhow!(e).context("move to recycle bin failed"))?;
                Ok(RemoteDeleteMode::RecycleBin)
            }
        }
    }

    fn count_remote_delete(&self, mode: RemoteDeleteMode, summary: &mut RunSummary) {
        match mode {
            RemoteDeleteMode::RecycleBin => summary.remote_soft_deleted += 1,
            RemoteDeleteMode::HardDelete => summary.remote_hard_deleted += 1,
        }
    }
}
