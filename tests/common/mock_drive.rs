//! In-memory Drive used by the integration tests
//!
//! Implements [`RemoteDrive`] over a hash-map tree, records every mutating
//! call, and supports scripted failures per operation. Same-name siblings
//! are allowed, matching the real namespace.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use feishu_sync_daemon::feishu_service::feishu_models::{RemoteItem, UploadResult};
use feishu_sync_daemon::feishu_service::{RemoteDrive, RemoteError};

pub const ROOT_TOKEN: &str = "fldr-root";

#[derive(Debug, Clone)]
pub struct MockFolder {
    pub name: String,
    pub parent: String,
}

#[derive(Debug, Clone)]
pub struct MockFile {
    pub name: String,
    pub parent: String,
    pub content: Vec<u8>,
    pub modified_time: String,
    pub kind: String,
}

#[derive(Default)]
pub struct MockDriveState {
    next_id: u64,
    clock: u64,
    pub folders: HashMap<String, MockFolder>,
    pub files: HashMap<String, MockFile>,
    /// Operation name -> remaining failures to inject.
    pub fail_ops: HashMap<String, u32>,
    /// Tokens whose download answers 404.
    pub gone_tokens: HashSet<String>,
    /// Every mutating call, e.g. `rename:tok:new.md`.
    pub calls: Vec<String>,
}

impl MockDriveState {
    fn next_token(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn tick(&mut self) -> String {
        self.clock += 1;
        // Epoch-ms strings, like the real listing endpoint.
        format!("{}", 1_700_000_000_000u64 + self.clock * 1000)
    }

    fn take_failure(&mut self, op: &str) -> bool {
        match self.fail_ops.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct MockDrive {
    state: Arc<Mutex<MockDriveState>>,
}

impl MockDrive {
    pub fn new() -> Self {
        let mut state = MockDriveState::default();
        state.folders.insert(
            ROOT_TOKEN.to_string(),
            MockFolder {
                name: "root".to_string(),
                parent: String::new(),
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn add_folder(&self, parent: &str, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let token = state.next_token("fldr");
        state.folders.insert(
            token.clone(),
            MockFolder {
                name: name.to_string(),
                parent: parent.to_string(),
            },
        );
        token
    }

    pub fn add_file(&self, parent: &str, name: &str, content: &[u8]) -> String {
        let mut state = self.state.lock().unwrap();
        let token = state.next_token("boxcn");
        let modified_time = state.tick();
        state.files.insert(
            token.clone(),
            MockFile {
                name: name.to_string(),
                parent: parent.to_string(),
                content: content.to_vec(),
                modified_time,
                kind: "file".to_string(),
            },
        );
        token
    }

    /// Like [`add_file`], but with an explicit modified time.
    pub fn add_file_with_mtime(
        &self,
        parent: &str,
        name: &str,
        content: &[u8],
        modified_time: &str,
    ) -> String {
        let token = self.add_file(parent, name, content);
        self.state
            .lock()
            .unwrap()
            .files
            .get_mut(&token)
            .unwrap()
            .modified_time = modified_time.to_string();
        token
    }

    /// Script `count` failures for an operation name
    /// (`upload`, `download`, `list`, `delete`, `move`, `rename`, `create_folder`).
    pub fn fail_next(&self, op: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .fail_ops
            .insert(op.to_string(), count);
    }

    pub fn mark_gone(&self, token: &str) {
        self.state.lock().unwrap().gone_tokens.insert(token.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn file(&self, token: &str) -> Option<MockFile> {
        self.state.lock().unwrap().files.get(token).cloned()
    }

    pub fn folder(&self, token: &str) -> Option<MockFolder> {
        self.state.lock().unwrap().folders.get(token).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    /// Find child tokens by name under a parent, files and folders alike.
    pub fn find_by_name(&self, parent: &str, name: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut tokens: Vec<String> = state
            .files
            .iter()
            .filter(|(_, f)| f.parent == parent && f.name == name)
            .map(|(t, _)| t.clone())
            .collect();
        tokens.extend(
            state
                .folders
                .iter()
                .filter(|(_, f)| f.parent == parent && f.name == name)
                .map(|(t, _)| t.clone()),
        );
        tokens.sort();
        tokens
    }
}

impl Default for MockDrive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteDrive for MockDrive {
    async fn resolve_root(&self) -> Result<String, RemoteError> {
        Ok(ROOT_TOKEN.to_string())
    }

    async fn list_children(&self, folder_token: &str) -> Result<Vec<RemoteItem>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.take_failure("list") {
            return Err(RemoteError::Transient("scripted list failure".to_string()));
        }
        if !state.folders.contains_key(folder_token) {
            return Err(RemoteError::Gone(format!(
                "code 1061007: file has been delete. ({})",
                folder_token
            )));
        }

        let mut items: Vec<RemoteItem> = Vec::new();
        for (token, folder) in &state.folders {
            if folder.parent == folder_token {
                items.push(RemoteItem {
                    token: token.clone(),
                    name: folder.name.clone(),
                    kind: "folder".to_string(),
                    size: 0,
                    modified_time: String::new(),
                    parent_token: folder_token.to_string(),
                });
            }
        }
        for (token, file) in &state.files {
            if file.parent == folder_token {
                items.push(RemoteItem {
                    token: token.clone(),
                    name: file.name.clone(),
                    kind: file.kind.clone(),
                    size: file.content.len() as u64,
                    modified_time: file.modified_time.clone(),
                    parent_token: folder_token.to_string(),
                });
            }
        }
        // Deterministic listing order.
        items.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(items)
    }

    async fn create_folder(&self, parent_token: &str, name: &str) -> Result<String, RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.take_failure("create_folder") {
            return Err(RemoteError::Transient("scripted create failure".to_string()));
        }
        let token = state.next_token("fldr");
        state.folders.insert(
            token.clone(),
            MockFolder {
                name: name.to_string(),
                parent: parent_token.to_string(),
            },
        );
        state.calls.push(format!("create_folder:{}:{}", parent_token, name));
        Ok(token)
    }

    async fn upload(
        &self,
        parent_token: &str,
        name: &str,
        local_path: &Path,
    ) -> Result<UploadResult, RemoteError> {
        let content = std::fs::read(local_path)
            .map_err(|e| RemoteError::Permanent(format!("cannot read upload source: {}", e)))?;

        let mut state = self.state.lock().unwrap();
        if state.take_failure("upload") {
            return Err(RemoteError::Transient("scripted upload failure".to_string()));
        }
        let token = state.next_token("boxcn");
        let modified_time = state.tick();
        state.files.insert(
            token.clone(),
            MockFile {
                name: name.to_string(),
                parent: parent_token.to_string(),
                content,
                modified_time,
                kind: "file".to_string(),
            },
        );
        state.calls.push(format!("upload:{}:{}", parent_token, name));
        Ok(UploadResult {
            file_token: token,
            revision_id: Some("1".to_string()),
        })
    }

    async fn download(&self, file_token: &str, dest_path: &Path) -> Result<(), RemoteError> {
        let content = {
            let mut state = self.state.lock().unwrap();
            if state.take_failure("download") {
                return Err(RemoteError::Transient(
                    "scripted download failure".to_string(),
                ));
            }
            if state.gone_tokens.contains(file_token) {
                return Err(RemoteError::Gone("download_failed_status_404".to_string()));
            }
            match state.files.get(file_token) {
                Some(file) => file.content.clone(),
                None => {
                    return Err(RemoteError::Gone("download_failed_status_404".to_string()))
                }
            }
        };

        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RemoteError::Permanent(e.to_string()))?;
        }
        std::fs::write(dest_path, content).map_err(|e| RemoteError::Permanent(e.to_string()))?;
        Ok(())
    }

    async fn rename(&self, file_token: &str, new_name: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.take_failure("rename") {
            return Err(RemoteError::Transient("scripted rename failure".to_string()));
        }
        state.calls.push(format!("rename:{}:{}", file_token, new_name));
        if let Some(file) = state.files.get_mut(file_token) {
            file.name = new_name.to_string();
            return Ok(());
        }
        if let Some(folder) = state.folders.get_mut(file_token) {
            folder.name = new_name.to_string();
            return Ok(());
        }
        Err(RemoteError::Gone("rename target missing".to_string()))
    }

    async fn move_item(
        &self,
        file_token: &str,
        _kind: &str,
        new_parent_token: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.take_failure("move") {
            return Err(RemoteError::Transient("scripted move failure".to_string()));
        }
        state
            .calls
            .push(format!("move:{}:{}", file_token, new_parent_token));
        if let Some(file) = state.files.get_mut(file_token) {
            file.parent = new_parent_token.to_string();
            return Ok(());
        }
        if let Some(folder) = state.folders.get_mut(file_token) {
            folder.parent = new_parent_token.to_string();
            return Ok(());
        }
        Err(RemoteError::Gone("move target missing".to_string()))
    }

    async fn hard_delete(&self, file_token: &str, _kind: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.take_failure("delete") {
            return Err(RemoteError::Transient("scripted delete failure".to_string()));
        }
        state.calls.push(format!("delete:{}", file_token));
        if state.files.remove(file_token).is_some() {
            return Ok(());
        }
        if state.folders.remove(file_token).is_some() {
            return Ok(());
        }
        Err(RemoteError::Gone("code 1061007: file has been delete.".to_string()))
    }
}
