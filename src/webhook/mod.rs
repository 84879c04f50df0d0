//! Event-driven trigger
//!
//! Consumes Drive change events pushed by the provider. The HTTP server
//! hosting the endpoint is the control console's concern; this module owns
//! the whole behavior behind it: verify-token check, payload decryption and
//! signature verification, url_verification echo, event-id deduplication,
//! event-type filtering, debounce, and dispatch onto the shared run lock.

pub mod crypto;

use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::SyncConfig;
use crate::persistency::now_iso;
use crate::sync::summary::RunSummary;
use crate::sync::{RunBusy, SyncService};

/// Seen event ids are remembered for this long.
pub const EVENT_DEDUP_TTL: Duration = Duration::from_secs(600);

/// How long the event worker waits for the run lock.
pub const EVENT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Signature-relevant request headers, as the provider sends them.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub signature: Option<String>,
}

/// Transport-independent response: status code plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookReply {
    pub status: u16,
    pub body: serde_json::Value,
}

impl WebhookReply {
    fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    fn rejected(reason: &str) -> Self {
        Self::ok(json!({ "msg": "success", "queued": false, "reason": reason }))
    }

    fn error(status: u16, detail: &str) -> Self {
        Self {
            status,
            body: json!({ "detail": detail }),
        }
    }
}

/// Published webhook observability state.
#[derive(Debug, Clone, Serialize, Default)]
pub struct WebhookStatus {
    pub enabled: bool,
    pub verify_token_configured: bool,
    pub encrypt_key_configured: bool,
    pub debounce_sec: u64,
    pub trigger_types: Vec<String>,
    pub pending: bool,
    pub last_received_at: Option<String>,
    pub last_event_type: Option<String>,
    pub last_event_id: Option<String>,
    pub last_challenge_at: Option<String>,
    pub last_trigger_requested_at: Option<String>,
    pub last_triggered_at: Option<String>,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
    pub received_count: u64,
    pub trigger_count: u64,
    pub skipped_unmatched_count: u64,
    pub skipped_debounce_count: u64,
    pub skipped_busy_count: u64,
    pub skipped_pending_count: u64,
    pub skipped_disabled_count: u64,
    pub duplicate_count: u64,
}

#[derive(Debug, Deserialize, Default)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    challenge: Option<String>,
    token: Option<String>,
    encrypt: Option<String>,
    header: Option<EventHeader>,
    event: Option<EventBody>,
}

#[derive(Debug, Deserialize, Default)]
struct EventHeader {
    event_id: Option<String>,
    token: Option<String>,
    event_type: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EventBody {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// What the trigger dispatches a queued event onto. The production
/// implementation is [`SyncService`]; tests substitute a recorder.
#[async_trait]
pub trait EventSyncRunner: Send + Sync {
    async fn run_event_sync(&self) -> Result<RunSummary, RunBusy>;
}

#[async_trait]
impl EventSyncRunner for SyncService {
    async fn run_event_sync(&self) -> Result<RunSummary, RunBusy> {
        self.run_with_lock_timeout(EVENT_LOCK_WAIT_TIMEOUT, "event")
            .await
    }
}

struct Inner {
    status: WebhookStatus,
    recent_ids: HashMap<String, Instant>,
    last_trigger_requested: Option<Instant>,
}

pub struct WebhookTrigger {
    inner: Arc<Mutex<Inner>>,
    runner: Arc<dyn EventSyncRunner>,
}

impl WebhookTrigger {
    pub fn new(runner: Arc<dyn EventSyncRunner>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                status: WebhookStatus::default(),
                recent_ids: HashMap::new(),
                last_trigger_requested: None,
            })),
            runner,
        }
    }

    /// Snapshot of the published state.
    pub fn status(&self) -> WebhookStatus {
        self.inner.lock().unwrap().status.clone()
    }

    /// Process one webhook request.
    pub async fn handle(
        &self,
        cfg: &SyncConfig,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> WebhookReply {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.status.enabled = cfg.event_callback_enabled;
            guard.status.verify_token_configured = !cfg.event_verify_token.is_empty();
            guard.status.encrypt_key_configured = !cfg.event_encrypt_key.is_empty();
            guard.status.debounce_sec = cfg.event_debounce_sec;
            guard.status.trigger_types = cfg.event_trigger_types.clone();
        }

        let Ok(mut envelope) = serde_json::from_slice::<EventEnvelope>(body) else {
            return WebhookReply::error(400, "malformed_json");
        };

        if let Some(encrypted) = envelope.encrypt.take() {
            if cfg.event_encrypt_key.is_empty() {
                return WebhookReply::error(400, "encrypted_payload_without_key");
            }
            if let Some(signature) = headers.signature.as_deref() {
                let timestamp = headers.timestamp.as_deref().unwrap_or("");
                let nonce = headers.nonce.as_deref().unwrap_or("");
                if !crypto::verify_signature(
                    timestamp,
                    nonce,
                    &cfg.event_encrypt_key,
                    body,
                    signature,
                ) {
                    return WebhookReply::error(401, "signature_mismatch");
                }
            }
            let plaintext = match crypto::decrypt_event(&cfg.event_encrypt_key, &encrypted) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!("event payload decryption failed: {:#}", e);
                    return WebhookReply::error(400, "decrypt_failed");
                }
            };
            envelope = match serde_json::from_str(&plaintext) {
                Ok(envelope) => envelope,
                Err(_) => return WebhookReply::error(400, "malformed_json"),
            };
        }

        if envelope.kind.as_deref() == Some("url_verification") {
            return self.handle_url_verification(cfg, &envelope);
        }

        self.handle_event_callback(cfg, &envelope).await
    }

    fn handle_url_verification(&self, cfg: &SyncConfig, envelope: &EventEnvelope) -> WebhookReply {
        if cfg.event_verify_token.is_empty() {
            return WebhookReply::error(503, "event_verify_token_missing");
        }
        if envelope.token.as_deref() != Some(cfg.event_verify_token.as_str()) {
            return WebhookReply::error(401, "verify_token_mismatch");
        }
        let challenge = envelope.challenge.clone().unwrap_or_default();
        self.inner.lock().unwrap().status.last_challenge_at = Some(now_iso());
        WebhookReply::ok(json!({ "challenge": challenge }))
    }

    async fn handle_event_callback(
        &self,
        cfg: &SyncConfig,
        envelope: &EventEnvelope,
    ) -> WebhookReply {
        let header = envelope.header.as_ref();
        let event_type = header
            .and_then(|h| h.event_type.clone())
            .or_else(|| envelope.event.as_ref().and_then(|e| e.kind.clone()))
            .unwrap_or_default();
        let event_id = header.and_then(|h| h.event_id.clone()).unwrap_or_default();

        {
            let mut guard = self.inner.lock().unwrap();
            guard.status.received_count += 1;
            guard.status.last_received_at = Some(now_iso());
            guard.status.last_event_type = Some(event_type.clone());
            guard.status.last_event_id = Some(event_id.clone());
        }

        if !cfg.event_callback_enabled {
            self.inner.lock().unwrap().status.skipped_disabled_count += 1;
            return WebhookReply::rejected("event_callback_disabled");
        }
        if cfg.event_verify_token.is_empty() {
            return WebhookReply::error(503, "event_verify_token_missing");
        }
        let presented = header.and_then(|h| h.token.as_deref()).unwrap_or("");
        if presented != cfg.event_verify_token {
            return WebhookReply::error(401, "verify_token_mismatch");
        }

        {
            let mut guard = self.inner.lock().unwrap();

            guard
                .recent_ids
                .retain(|_, seen| seen.elapsed() < EVENT_DEDUP_TTL);
            if !event_id.is_empty() {
                if guard.recent_ids.contains_key(&event_id) {
                    guard.status.duplicate_count += 1;
                    return WebhookReply::rejected("duplicate_event");
                }
                guard.recent_ids.insert(event_id.clone(), Instant::now());
            }

            if !matches_event_type(&cfg.event_trigger_types, &event_type) {
                guard.status.skipped_unmatched_count += 1;
                return WebhookReply::rejected("unmatched_event_type");
            }

            if cfg.event_debounce_sec > 0 {
                if let Some(last) = guard.last_trigger_requested {
                    if last.elapsed() < Duration::from_secs(cfg.event_debounce_sec) {
                        guard.status.skipped_debounce_count += 1;
                        return WebhookReply::rejected("debounced");
                    }
                }
            }

            if guard.status.pending {
                guard.status.skipped_pending_count += 1;
                return WebhookReply::rejected("pending_job");
            }

            guard.status.pending = true;
            guard.last_trigger_requested = Some(Instant::now());
            guard.status.last_trigger_requested_at = Some(now_iso());
        }

        self.spawn_event_sync();

        WebhookReply::ok(json!({
            "msg": "success",
            "queued": true,
            "event_type": event_type,
            "event_id": event_id,
        }))
    }

    /// Run the sync in the background, bounded by the shared run lock.
    fn spawn_event_sync(&self) {
        let inner = self.inner.clone();
        let runner = self.runner.clone();
        tokio::spawn(async move {
            let result = runner.run_event_sync().await;

            let mut guard = inner.lock().unwrap();
            guard.status.pending = false;
            guard.status.last_triggered_at = Some(now_iso());
            match result {
                Ok(summary) => {
                    guard.status.trigger_count += 1;
                    if summary.is_failed() {
                        guard.status.last_result = Some("failed".to_string());
                        guard.status.last_error = Some(summary.fatal_error);
                    } else if summary.is_partial() {
                        guard.status.last_result = Some("warning".to_string());
                        guard.status.last_error = None;
                    } else {
                        guard.status.last_result = Some("success".to_string());
                        guard.status.last_error = None;
                    }
                }
                Err(RunBusy) => {
                    guard.status.skipped_busy_count += 1;
                    guard.status.last_result = Some("skipped_busy".to_string());
                }
            }
        });
    }
}

/// Glob match an event type against the configured trigger set.
fn matches_event_type(patterns: &[String], event_type: &str) -> bool {
    if event_type.is_empty() {
        return false;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!("invalid event trigger pattern {:?}: {}", pattern, e),
        }
    }
    builder
        .build()
        .map(|set| set.is_match(event_type))
        .unwrap_or(false)
}
