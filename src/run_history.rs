//! Run history files
//!
//! Every run summary is first appended to a JSONL history file (newest at
//! the bottom), then overwritten into the last-run file. The order makes
//! summary publication atomic per run: observers never see a last-run
//! entry that is missing from the history.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::sync::summary::RunSummary;

pub struct RunHistory {
    history_path: PathBuf,
    last_run_path: PathBuf,
}

impl RunHistory {
    pub fn new(history_path: PathBuf, last_run_path: PathBuf) -> Self {
        Self {
            history_path,
            last_run_path,
        }
    }

    /// Append to the history, then replace the last-run file.
    pub fn record(&self, summary: &RunSummary) -> Result<()> {
        let line = serde_json::to_string(summary).context("cannot serialize run summary")?;

        if let Some(parent) = self.history_path.parent() {
            fs::create_dir_all(parent).context("cannot create runtime directory")?;
        }
        let mut history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .with_context(|| format!("cannot open {}", self.history_path.display()))?;
        writeln!(history, "{}", line)?;

        let parent = self
            .last_run_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .context("cannot create temp last-run file")?;
        tmp.write_all(line.as_bytes())?;
        tmp.persist(&self.last_run_path)
            .map_err(|e| anyhow!("cannot persist last-run file: {}", e))?;
        Ok(())
    }

    /// The most recent summary, if any run has completed.
    pub fn last(&self) -> Result<Option<RunSummary>> {
        if !self.last_run_path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.last_run_path)?;
        if data.trim().is_empty() {
            return Ok(None);
        }
        let summary = serde_json::from_str(&data).context("invalid last-run file")?;
        Ok(Some(summary))
    }

    /// The newest `n` history entries, oldest of them first.
    pub fn tail(&self, n: usize) -> Result<Vec<RunSummary>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.history_path)?;
        let lines: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(n);
        lines[start..]
            .iter()
            .map(|line| serde_json::from_str(line).context("invalid history line"))
            .collect()
    }
}
