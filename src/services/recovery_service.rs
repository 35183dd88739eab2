//! Crash and offline recovery
//!
//! While a session runs, a heartbeat timestamp is written to the session
//! table every few seconds. A clean shutdown writes a marker and removes
//! the heartbeat. On the next start, a stale heartbeat without the marker
//! means the previous session died; its unfinished draft and queued tasks
//! are surfaced for resuming.

use crate::config::RecoverySettings;
use crate::database::{DurableStore, StoreResult};
use crate::models::{ProtocolDraft, QueueTask};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HEARTBEAT_KEY: &str = "recovery.heartbeat";
pub const CLEAN_SHUTDOWN_KEY: &str = "recovery.clean_shutdown";
pub const ACTIVE_PROTOCOL_KEY: &str = "recovery.active_protocol";

/// Time source, injectable for tests
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// What the previous, crashed session left behind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrashReport {
    pub last_heartbeat_ms: i64,
    pub detected_at_ms: i64,
    pub gap_ms: i64,
    /// Protocol that was being captured, if recorded
    pub active_protocol: Option<String>,
    /// Draft with fewer confirmed uploads than photos
    pub resumable_draft: Option<ProtocolDraft>,
    pub queued_tasks: Vec<QueueTask>,
}

/// Records the protocol a run is working on
pub async fn mark_active_protocol(store: &DurableStore, protocol_id: &str) -> StoreResult<()> {
    store.set_session_value(ACTIVE_PROTOCOL_KEY, protocol_id).await
}

/// Clears the active protocol if it is still `protocol_id`
pub async fn clear_active_protocol(store: &DurableStore, protocol_id: &str) -> StoreResult<()> {
    if store.get_session_value(ACTIVE_PROTOCOL_KEY).await?.as_deref() == Some(protocol_id) {
        store.remove_session_value(ACTIVE_PROTOCOL_KEY).await?;
    }
    Ok(())
}

pub struct RecoveryService {
    store: DurableStore,
    clock: Arc<dyn Clock>,
    heartbeat_interval: Duration,
    crash_threshold: Duration,
    heartbeat: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RecoveryService {
    pub fn new(store: DurableStore, clock: Arc<dyn Clock>, settings: &RecoverySettings) -> Self {
        Self {
            store,
            clock,
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs.max(1)),
            crash_threshold: Duration::from_secs(settings.crash_threshold_secs),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Starts a session: checks the previous one, then begins the heartbeat.
    ///
    /// Fails only when the store cannot be initialised.
    pub async fn initialize(&self) -> StoreResult<Option<CrashReport>> {
        self.store.init().await?;

        let report = self.detect_previous_crash().await?;
        if let Some(report) = &report {
            log::warn!(
                "Previous session ended without clean shutdown ({}s since last heartbeat)",
                report.gap_ms / 1000
            );
            // Nothing is uploading any more; rows left in that state are orphans
            self.store.mark_in_flight_failed(None).await?;
        }

        self.store.remove_session_value(CLEAN_SHUTDOWN_KEY).await?;
        self.beat().await?;
        self.start_heartbeat();
        Ok(report)
    }

    /// Returns a report when the last session crashed, `None` after a clean
    /// shutdown, on first start, or when the heartbeat is recent.
    pub async fn detect_previous_crash(&self) -> StoreResult<Option<CrashReport>> {
        if self.store.get_session_value(CLEAN_SHUTDOWN_KEY).await?.is_some() {
            return Ok(None);
        }
        let Some(last_heartbeat_ms) = self
            .store
            .get_session_value(HEARTBEAT_KEY)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
        else {
            return Ok(None);
        };

        let now = self.clock.now_ms();
        let gap_ms = now - last_heartbeat_ms;
        if gap_ms <= self.crash_threshold.as_millis() as i64 {
            return Ok(None);
        }

        let active_protocol = self.store.get_session_value(ACTIVE_PROTOCOL_KEY).await?;
        let resumable_draft = match &active_protocol {
            Some(id) => self
                .store
                .get_draft(id)
                .await?
                .filter(|d| d.is_incomplete()),
            None => self
                .store
                .get_all_drafts()
                .await?
                .into_iter()
                .find(|d| d.is_incomplete()),
        };
        let queued_tasks = self.store.get_queued_tasks().await?;

        Ok(Some(CrashReport {
            last_heartbeat_ms,
            detected_at_ms: now,
            gap_ms,
            active_protocol,
            resumable_draft,
            queued_tasks,
        }))
    }

    /// Writes the heartbeat timestamp once
    pub async fn beat(&self) -> StoreResult<()> {
        self.store
            .set_session_value(HEARTBEAT_KEY, &self.clock.now_ms().to_string())
            .await
    }

    fn start_heartbeat(&self) {
        let Ok(mut slot) = self.heartbeat.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = self.store.clone();
        let clock = self.clock.clone();
        let interval = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = clock.now_ms().to_string();
                        if let Err(e) = store.set_session_value(HEARTBEAT_KEY, &now).await {
                            log::warn!("Heartbeat write failed: {}", e);
                        }
                    }
                }
            }
            log::debug!("Heartbeat stopped");
        });
        *slot = Some((cancel, handle));
    }

    fn stop_heartbeat(&self) {
        let taken = match self.heartbeat.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some((cancel, _handle)) = taken {
            cancel.cancel();
        }
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Clean shutdown: stops the heartbeat and writes the marker
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.stop_heartbeat();
        self.store
            .set_session_value(CLEAN_SHUTDOWN_KEY, &self.clock.now_ms().to_string())
            .await?;
        self.store.remove_session_value(HEARTBEAT_KEY).await?;
        log::info!("Session closed cleanly");
        Ok(())
    }

    pub async fn set_active_protocol(&self, protocol_id: &str) -> StoreResult<()> {
        mark_active_protocol(&self.store, protocol_id).await
    }

    /// Incomplete drafts and queued tasks, whether or not there was a crash
    pub async fn resumable_work(&self) -> StoreResult<(Vec<ProtocolDraft>, Vec<QueueTask>)> {
        let drafts = self
            .store
            .get_all_drafts()
            .await?
            .into_iter()
            .filter(|d| d.is_incomplete())
            .collect();
        let queued = self.store.get_queued_tasks().await?;
        Ok((drafts, queued))
    }
}

impl Drop for RecoveryService {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
