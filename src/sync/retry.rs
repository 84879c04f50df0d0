//! Retry payloads
//!
//! Failed operations are queued as a tagged union; JSON only exists at the
//! state-store edge. An unknown opcode in a stored row is a programmer
//! error and the row is discarded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scanner::RemoteFile;

/// Quarantine directory name; retry payloads must never reference it.
pub const QUARANTINE_DIR: &str = ".sync_quarantine";

/// The operation a retry row re-attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPayload {
    Upload {
        rel_path: String,
    },
    Pull {
        rel_path: String,
        remote_item: RemoteFile,
    },
    DeleteRemote {
        remote_token: String,
        remote_type: String,
    },
    DeleteLocal {
        rel_path: String,
    },
}

impl RetryPayload {
    /// Opcode stored in the queue's `op_type` column.
    pub fn op_type(&self) -> &'static str {
        match self {
            RetryPayload::Upload { .. } => "upload",
            RetryPayload::Pull { .. } => "pull",
            RetryPayload::DeleteRemote { .. } => "delete_remote",
            RetryPayload::DeleteLocal { .. } => "delete_local",
        }
    }

    /// The local path the payload touches, if any.
    pub fn rel_path(&self) -> Option<&str> {
        match self {
            RetryPayload::Upload { rel_path }
            | RetryPayload::Pull { rel_path, .. }
            | RetryPayload::DeleteLocal { rel_path } => Some(rel_path),
            RetryPayload::DeleteRemote { .. } => None,
        }
    }

    /// Whether the payload points inside a service-internal directory
    /// (trash, quarantine). Such rows are skipped as policy violations.
    pub fn targets_internal_path(&self, local_trash_dir: &str) -> bool {
        match self.rel_path() {
            Some(rel) => {
                rel.starts_with(&format!("{}/", local_trash_dir))
                    || rel.starts_with(&format!("{}/", QUARANTINE_DIR))
            }
            None => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize retry payload")
    }

    pub fn from_json(payload_json: &str) -> Result<Self> {
        serde_json::from_str(payload_json).context("Failed to parse retry payload")
    }
}
