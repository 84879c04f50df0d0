//! Per-run summary document
//!
//! One of these is produced by every run, appended to the JSONL history and
//! overwritten into the last-run file. Observers tell success from partial
//! failure by `errors > 0` or a non-empty `fatal_error`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunSummary {
    pub run_id: i64,
    pub run_type: String,
    pub local_root: String,
    pub remote_root_token: String,
    pub local_total: u64,
    pub remote_total: u64,
    pub uploaded: u64,
    pub downloaded: u64,
    pub renamed: u64,
    pub conflicts: u64,
    pub remote_soft_deleted: u64,
    pub remote_hard_deleted: u64,
    pub local_soft_deleted: u64,
    pub remote_empty_dirs_deleted: u64,
    pub remote_dirs_deleted: u64,
    pub remote_dirs_recursive_deleted: u64,
    pub retry_success: u64,
    pub retry_failed: u64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fatal_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RunSummary {
    pub fn new(run_type: &str) -> Self {
        Self {
            run_type: run_type.to_string(),
            ..Default::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        !self.fatal_error.is_empty()
    }

    /// Completed, but with per-entry errors swallowed into counters.
    pub fn is_partial(&self) -> bool {
        !self.is_failed() && self.errors > 0
    }
}
