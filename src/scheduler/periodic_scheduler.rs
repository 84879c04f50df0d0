//! Periodic sync scheduler
//!
//! A cooperative loop with a cancellable wait. The interval is re-read from
//! configuration every cycle, so runtime changes take effect by recomputing
//! the next deadline relative to now. Runs are triggered non-blockingly:
//! when another trigger holds the run lock, the cycle is recorded as
//! `skipped_busy` and requeued.

use chrono::{Duration as ChronoDuration, Local};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::persistency::now_iso;
use crate::sync::{RunBusy, SyncService};

/// Smallest accepted poll interval, seconds.
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;

/// Largest accepted poll interval, seconds.
pub const MAX_POLL_INTERVAL_SECS: u64 = 86_400;

/// Granularity of the cancellable wait.
const TICK: Duration = Duration::from_secs(1);

/// Clamp a configured interval; 0 stays 0 and disables the scheduler.
pub fn effective_interval(configured: u64) -> u64 {
    if configured == 0 {
        0
    } else {
        configured.clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS)
    }
}

/// Published scheduler observability state.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SchedulerState {
    pub running: bool,
    pub enabled: bool,
    pub configured_interval: u64,
    pub effective_interval: u64,
    pub last_started_at: Option<String>,
    pub last_finished_at: Option<String>,
    /// success | warning | failed | skipped_busy | running
    pub last_result: Option<String>,
    pub last_error: Option<String>,
    pub next_run_at: Option<String>,
    pub run_count: u64,
    pub skipped_busy_count: u64,
}

pub struct SyncScheduler {
    service: Arc<SyncService>,
    config: Arc<RwLock<AppConfig>>,
    state: Arc<Mutex<SchedulerState>>,
    stop_tx: watch::Sender<bool>,
}

impl SyncScheduler {
    pub fn new(service: Arc<SyncService>, config: Arc<RwLock<AppConfig>>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            service,
            config,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            stop_tx,
        }
    }

    /// Snapshot of the published state.
    pub fn state(&self) -> SchedulerState {
        self.state.lock().unwrap().clone()
    }

    /// Ask the loop to exit after the current cycle. A run in progress is
    /// not interrupted; the loop observes the signal between waits.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        info!("scheduler stop requested");
    }

    /// Spawn the scheduler loop.
    pub fn start(&self) -> JoinHandle<()> {
        let service = self.service.clone();
        let config = self.config.clone();
        let state = self.state.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            info!("scheduler started");
            let mut deadline: Option<Instant> = None;
            let mut armed_interval: Option<u64> = None;

            loop {
                if *stop_rx.borrow() {
                    break;
                }

                let configured = config.read().await.sync.poll_interval_sec;
                let effective = effective_interval(configured);
                {
                    let mut s = state.lock().unwrap();
                    s.enabled = effective > 0;
                    s.configured_interval = configured;
                    s.effective_interval = effective;
                }

                if effective == 0 {
                    deadline = None;
                    armed_interval = None;
                    state.lock().unwrap().next_run_at = None;
                    tokio::select! {
                        _ = tokio::time::sleep(TICK) => {}
                        _ = stop_rx.changed() => {}
                    }
                    continue;
                }

                // Arm (or re-arm on interval change) relative to now.
                if deadline.is_none() || armed_interval != Some(effective) {
                    deadline = Some(Instant::now() + Duration::from_secs(effective));
                    armed_interval = Some(effective);
                    state.lock().unwrap().next_run_at = Some(
                        (Local::now() + ChronoDuration::seconds(effective as i64))
                            .format("%Y-%m-%dT%H:%M:%S")
                            .to_string(),
                    );
                }

                if Instant::now() < deadline.unwrap() {
                    tokio::select! {
                        _ = tokio::time::sleep(TICK) => {}
                        _ = stop_rx.changed() => {}
                    }
                    continue;
                }

                // Deadline reached: run, then requeue relative to now.
                deadline = None;
                armed_interval = None;
                {
                    let mut s = state.lock().unwrap();
                    s.running = true;
                    s.last_started_at = Some(now_iso());
                    s.last_result = Some("running".to_string());
                }

                match service.try_run("scheduled").await {
                    Ok(summary) => {
                        let mut s = state.lock().unwrap();
                        s.run_count += 1;
                        if summary.is_failed() {
                            s.last_result = Some("failed".to_string());
                            s.last_error = Some(summary.fatal_error.clone());
                            error!("scheduled run failed: {}", summary.fatal_error);
                        } else if summary.is_partial() {
                            s.last_result = Some("warning".to_string());
                            s.last_error = None;
                            warn!("scheduled run finished with {} errors", summary.errors);
                        } else {
                            s.last_result = Some("success".to_string());
                            s.last_error = None;
                        }
                    }
                    Err(RunBusy) => {
                        let mut s = state.lock().unwrap();
                        s.skipped_busy_count += 1;
                        s.last_result = Some("skipped_busy".to_string());
                        warn!("scheduled run skipped, another trigger holds the lock");
                    }
                }

                {
                    let mut s = state.lock().unwrap();
                    s.running = false;
                    s.last_finished_at = Some(now_iso());
                }
            }
            info!("scheduler stopped");
        })
    }
}
