//! Remote tree indexer
//!
//! Walks the Drive tree from the root folder, yielding every file with its
//! slash-joined path and a `path -> folder token` map. The recycle folder
//! directly under the root is excluded with its whole subtree. The Drive is
//! a tree, but mislabeled permissions have produced loops in the wild, so
//! a visited set stops re-descent.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::feishu_service::{RemoteDrive, RemoteError};

/// A remote file with its path from the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub token: String,
    pub kind: String,
    pub name: String,
    pub size: u64,
    pub modified_time: String,
    pub parent_token: String,
    /// Slash-joined name path from the root. Names containing slashes are
    /// joined as-is and simply yield a conflicting path.
    pub path: String,
}

/// Result of one remote walk.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub files: Vec<RemoteFile>,
    /// `path -> folder token` for every folder, plus `"" -> root`.
    pub folders: HashMap<String, String>,
    /// Per-folder `name -> token` of child folders, seeded for the engine's
    /// folder cache.
    pub folder_children: HashMap<String, HashMap<String, String>>,
}

pub struct RemoteTreeIndexer<'a> {
    drive: &'a dyn RemoteDrive,
    recycle_bin_name: &'a str,
}

impl<'a> RemoteTreeIndexer<'a> {
    pub fn new(drive: &'a dyn RemoteDrive, recycle_bin_name: &'a str) -> Self {
        Self {
            drive,
            recycle_bin_name,
        }
    }

    fn under_recycle_bin(&self, path: &str) -> bool {
        path == self.recycle_bin_name
            || path.starts_with(&format!("{}/", self.recycle_bin_name))
    }

    /// Walk the whole tree under `root_token`.
    pub async fn index(&self, root_token: &str) -> Result<RemoteSnapshot, RemoteError> {
        let mut snapshot = RemoteSnapshot::default();
        snapshot
            .folders
            .insert(String::new(), root_token.to_string());

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root_token.to_string());

        let mut pending: Vec<(String, String)> = vec![(String::new(), root_token.to_string())];
        while let Some((prefix, folder_token)) = pending.pop() {
            let children = self.drive.list_children(&folder_token).await?;
            let mut child_folders = HashMap::new();

            for item in children {
                let path = if prefix.is_empty() {
                    item.name.clone()
                } else {
                    format!("{}/{}", prefix, item.name)
                };

                if item.is_folder() {
                    child_folders.insert(item.name.clone(), item.token.clone());
                    snapshot.folders.insert(path.clone(), item.token.clone());
                    if self.under_recycle_bin(&path) {
                        continue;
                    }
                    if !visited.insert(item.token.clone()) {
                        warn!("folder cycle detected at {} ({}), skipping", path, item.token);
                        continue;
                    }
                    pending.push((path, item.token));
                } else {
                    if self.under_recycle_bin(&path) {
                        continue;
                    }
                    snapshot.files.push(RemoteFile {
                        token: item.token,
                        kind: item.kind,
                        name: item.name,
                        size: item.size,
                        modified_time: item.modified_time,
                        parent_token: folder_token.clone(),
                        path,
                    });
                }
            }

            snapshot.folder_children.insert(folder_token, child_folders);
        }

        Ok(snapshot)
    }
}
