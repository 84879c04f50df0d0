//! Context-carried log sink
//!
//! The engine does not assume a global logger; it receives a sink with one
//! `emit` operation. The service sink forwards to the `log` macros and
//! appends a row to the `logs` table for the observability readers.

use log::{error, info, warn};
use sqlx::{Pool, Sqlite};
use std::sync::Mutex;

/// Severity of an engine log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One-operation logging interface handed to the engine.
pub trait LogSink: Send + Sync {
    fn emit(&self, level: LogLevel, module: &str, message: &str, detail: Option<&str>);
}

/// Production sink: `log` macros plus a persisted row.
pub struct ServiceLogSink {
    pool: Pool<Sqlite>,
}

impl ServiceLogSink {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

impl LogSink for ServiceLogSink {
    fn emit(&self, level: LogLevel, module: &str, message: &str, detail: Option<&str>) {
        match level {
            LogLevel::Info => info!("[{}] {} {}", module, message, detail.unwrap_or("")),
            LogLevel::Warn => warn!("[{}] {} {}", module, message, detail.unwrap_or("")),
            LogLevel::Error => error!("[{}] {} {}", module, message, detail.unwrap_or("")),
        }

        // Persist fire-and-forget; a sink must never block the run.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            let level = level.as_str().to_string();
            let module = module.to_string();
            let message = message.to_string();
            let detail = detail.map(|d| d.to_string());
            handle.spawn(async move {
                let repo = crate::persistency::log_repository::LogRepository::new(pool);
                if let Err(e) = repo.insert(&level, &module, &message, detail.as_deref()).await {
                    warn!("failed to persist log line: {}", e);
                }
            });
        }
    }
}

/// Sink that drops everything. Used by dry runs of helper tools.
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn emit(&self, _level: LogLevel, _module: &str, _message: &str, _detail: Option<&str>) {}
}

/// Sink that records lines in memory, for assertions in tests.
#[derive(Default)]
pub struct RecordingLogSink {
    pub lines: Mutex<Vec<(LogLevel, String, String, Option<String>)>>,
}

impl RecordingLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, message, _)| message.clone())
            .collect()
    }
}

impl LogSink for RecordingLogSink {
    fn emit(&self, level: LogLevel, module: &str, message: &str, detail: Option<&str>) {
        self.lines.lock().unwrap().push((
            level,
            module.to_string(),
            message.to_string(),
            detail.map(|d| d.to_string()),
        ));
    }
}
