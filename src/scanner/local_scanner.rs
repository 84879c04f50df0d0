//! Local filesystem scanner
//!
//! Walks the local root, yielding relative directory paths and files with
//! size, mtime, and content hash. Excluded directories are pruned during
//! traversal; symlinks are never followed. Files that cannot be read are
//! logged, skipped, and counted as errors.

use log::warn;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::scanner::safe_rel_path;

/// Hash read buffer, 64 KiB.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// One scanned file.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub rel_path: String,
    pub full_path: PathBuf,
    /// SHA-256 of the file bytes, lowercase hex.
    pub hash: String,
    /// Modification time as epoch seconds.
    pub mtime: f64,
    pub size: u64,
}

/// Result of one local walk.
#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    /// Relative directory paths, sorted, root itself excluded.
    pub dirs: Vec<String>,
    pub files: BTreeMap<String, LocalFile>,
    /// Unreadable entries encountered during the walk.
    pub scan_errors: u64,
}

pub struct LocalScanner {
    root: PathBuf,
    exclude_dirs: HashSet<String>,
    exclude_hidden_dirs: bool,
    exclude_hidden_files: bool,
}

impl LocalScanner {
    pub fn new(
        root: &Path,
        exclude_dirs: &[String],
        exclude_hidden_dirs: bool,
        exclude_hidden_files: bool,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            exclude_dirs: exclude_dirs.iter().cloned().collect(),
            exclude_hidden_dirs,
            exclude_hidden_files,
        }
    }

    /// Walk the root. A missing root yields an empty snapshot.
    pub fn scan(&self) -> LocalSnapshot {
        let mut snapshot = LocalSnapshot::default();
        if !self.root.exists() {
            return snapshot;
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("cannot read directory {}: {}", dir.display(), e);
                    snapshot.scan_errors += 1;
                    continue;
                }
            };

            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("cannot read entry under {}: {}", dir.display(), e);
                        snapshot.scan_errors += 1;
                        continue;
                    }
                };
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();

                let file_type = match entry.file_type() {
                    Ok(ft) => ft,
                    Err(e) => {
                        warn!("cannot stat {}: {}", path.display(), e);
                        snapshot.scan_errors += 1;
                        continue;
                    }
                };
                if file_type.is_symlink() {
                    continue;
                }

                if file_type.is_dir() {
                    if self.prune_dir(&name) {
                        continue;
                    }
                    if let Some(rel) = self.rel_path_of(&path) {
                        snapshot.dirs.push(rel);
                    }
                    pending.push(path);
                } else if file_type.is_file() {
                    if self.exclude_hidden_files && name.starts_with('.') {
                        continue;
                    }
                    match self.scan_file(&path) {
                        Ok(Some(file)) => {
                            snapshot.files.insert(file.rel_path.clone(), file);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("cannot hash {}: {}", path.display(), e);
                            snapshot.scan_errors += 1;
                        }
                    }
                }
            }
        }

        snapshot.dirs.sort();
        snapshot
    }

    fn prune_dir(&self, name: &str) -> bool {
        if self.exclude_dirs.contains(name) {
            return true;
        }
        self.exclude_hidden_dirs && name.starts_with('.')
    }

    fn rel_path_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let rel = safe_rel_path(&rel.to_string_lossy());
        if rel.is_empty() {
            None
        } else {
            Some(rel)
        }
    }

    fn scan_file(&self, path: &Path) -> std::io::Result<Option<LocalFile>> {
        let Some(rel_path) = self.rel_path_of(path) else {
            return Ok(None);
        };
        let metadata = fs::metadata(path)?;
        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Ok(Some(LocalFile {
            rel_path,
            full_path: path.to_path_buf(),
            hash: sha256_file(path)?,
            mtime,
            size: metadata.len(),
        }))
    }
}

/// Streaming SHA-256 of a file's bytes, lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
