//! Row records for the state store
//!
//! Readers snapshot rows into these plain records; nothing here holds a
//! database handle.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a file mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStatus {
    Active,
    Conflict,
    Deleted,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Active => "active",
            MappingStatus::Conflict => "conflict",
            MappingStatus::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MappingStatus::Active),
            "conflict" => Some(MappingStatus::Conflict),
            "deleted" => Some(MappingStatus::Deleted),
            _ => None,
        }
    }
}

/// Durable link between a local path and a remote file identifier.
#[derive(Debug, Clone)]
pub struct FileMapping {
    pub id: i64,
    pub local_rel_path: String,
    pub remote_token: String,
    pub remote_type: String,
    /// SHA-256 of the local bytes at last sync.
    pub local_hash: String,
    /// Remote fingerprint `(modified_time:size)` at last sync.
    pub remote_hash: String,
    pub local_mtime: f64,
    pub remote_modified_time: String,
    pub status: MappingStatus,
    pub conflict: bool,
    pub last_synced_at: Option<String>,
}

/// Field set written on every mapping upsert.
#[derive(Debug, Clone)]
pub struct FileMappingUpsert {
    pub local_rel_path: String,
    pub remote_token: String,
    pub remote_type: String,
    pub local_hash: String,
    pub remote_hash: String,
    pub local_mtime: f64,
    pub remote_modified_time: String,
    pub status: MappingStatus,
    pub conflict: bool,
}

/// Durable link between a local directory and a remote folder.
#[derive(Debug, Clone)]
pub struct FolderMapping {
    pub id: i64,
    pub local_rel_dir: String,
    pub remote_folder_token: String,
}

/// Which side of a sync a tombstone records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneSide {
    Local,
    Remote,
}

impl TombstoneSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TombstoneSide::Local => "local",
            TombstoneSide::Remote => "remote",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "local" => Some(TombstoneSide::Local),
            "remote" => Some(TombstoneSide::Remote),
            _ => None,
        }
    }
}

/// Append-only record of a side deletion or a vanished remote resource.
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub id: i64,
    pub side: TombstoneSide,
    pub local_rel_path: Option<String>,
    pub remote_token: Option<String>,
    pub reason: String,
    pub created_at: String,
}

/// A queued retry of a failed operation.
#[derive(Debug, Clone)]
pub struct RetryRow {
    pub id: i64,
    pub op_type: String,
    pub payload_json: String,
    pub attempt_count: u32,
    pub next_retry_at: String,
    pub last_error: String,
}

/// One reconciliation run, as recorded in the run history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub run_type: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub summary_json: String,
}

/// One persisted engine log line.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub id: i64,
    pub level: String,
    pub module: String,
    pub message: String,
    pub detail: Option<String>,
    pub created_at: String,
}
