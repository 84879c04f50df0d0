//! Error taxonomy for the Drive boundary
//!
//! Errors are categorized by what the engine should do about them, not by
//! wire code: transient failures are retried with backoff, gone resources
//! are tombstoned, permanent failures are retried once and then discarded.

use thiserror::Error;

/// Drive API error code for "file has been deleted".
const CODE_FILE_DELETED: i64 = 1061007;

/// Drive API error code for request rate limiting.
const CODE_RATE_LIMITED: i64 = 99991400;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// No valid access token could be acquired. Runs fail fast on this.
    #[error("no valid access token available")]
    AuthUnavailable,

    /// The specific remote resource no longer exists.
    #[error("remote resource gone: {0}")]
    Gone(String),

    /// Timeouts, connection failures, 5xx, rate limiting.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Malformed requests, permission problems, quota.
    #[error("permanent remote failure: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn is_gone(&self) -> bool {
        matches!(self, RemoteError::Gone(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Categorize an HTTP status that reached us without a parsable body.
    pub fn from_status(status: reqwest::StatusCode, detail: &str) -> Self {
        if status.as_u16() == 404 {
            RemoteError::Gone(format!("status 404: {}", detail))
        } else if status.as_u16() == 429 || status.is_server_error() {
            RemoteError::Transient(format!("status {}: {}", status.as_u16(), detail))
        } else {
            RemoteError::Permanent(format!("status {}: {}", status.as_u16(), detail))
        }
    }

    /// Categorize a non-zero Drive API envelope code.
    pub fn from_api_code(code: i64, msg: &str) -> Self {
        match code {
            CODE_FILE_DELETED => RemoteError::Gone(format!("code {}: {}", code, msg)),
            CODE_RATE_LIMITED => RemoteError::Transient(format!("code {}: {}", code, msg)),
            _ => RemoteError::Permanent(format!("code {}: {}", code, msg)),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            RemoteError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteError::from_status(status, &err.to_string())
        } else {
            RemoteError::Transient(err.to_string())
        }
    }
}
