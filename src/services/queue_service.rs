//! Background resync of the durable upload queue.
//!
//! A sweep walks the queue oldest first and gives every due task one more
//! attempt. Tasks leave the queue when they succeed, when their bytes are no
//! longer resolvable, on a client error, or after `max_retries` failures.
//! A task whose recorded token slot is empty waits for sign-in instead of
//! being attempted.

use crate::config::QueueSettings;
use crate::database::{DurableStore, StoreError, StoreResult};
use crate::models::{QueueTask, UploadStatus, Variant};
use crate::services::auth::AuthTokens;
use crate::services::error_classifier::{categorize_upload, ErrorCategory};
use crate::services::recovery_service::Clock;
use crate::services::retry_policy::queue_backoff;
use crate::services::upload_service::{NoopObserver, UploadExecutor};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SWEEP_LOG_CAP: usize = 500;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepStats {
    pub attempted: usize,
    pub uploaded: usize,
    /// Failed again, kept for a later sweep
    pub rescheduled: usize,
    /// Removed without success
    pub dropped: usize,
    /// Not due yet because of backoff
    pub deferred: usize,
    /// Skipped because no token is stored for the task's auth context
    pub awaiting_auth: usize,
}

/// In-memory sweep history, lost on restart
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepLogEntry {
    pub ts_ms: i64,
    pub stats: SweepStats,
}

pub struct ResyncService {
    store: DurableStore,
    executor: UploadExecutor,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    tokens: Option<AuthTokens>,
    sweep_lock: tokio::sync::Mutex<()>,
    sweep_log: Mutex<Vec<SweepLogEntry>>,
    running: AtomicBool,
    next_sync_at: AtomicI64,
}

impl ResyncService {
    pub fn new(
        store: DurableStore,
        executor: UploadExecutor,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            executor,
            settings,
            clock,
            tokens: None,
            sweep_lock: tokio::sync::Mutex::new(()),
            sweep_log: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            next_sync_at: AtomicI64::new(0),
        }
    }

    /// Token store consulted for each task's `auth_context` before an attempt
    pub fn with_tokens(mut self, tokens: AuthTokens) -> Self {
        self.tokens = Some(tokens);
        self
    }

    async fn has_credentials(&self, task: &QueueTask) -> bool {
        match (&self.tokens, task.auth_context.as_deref()) {
            (Some(tokens), Some(slot)) => tokens.token_in(slot).await.is_some(),
            _ => true,
        }
    }

    fn is_due(&self, task: &QueueTask, now: i64) -> bool {
        match task.last_attempt {
            None => true,
            Some(last) => {
                let wait = queue_backoff(&self.settings, task.retries);
                now >= last + wait.as_millis() as i64
            }
        }
    }

    /// Removes a task that will not be retried and fails its image row
    async fn drop_task(&self, task: &QueueTask, reason: &str) -> StoreResult<()> {
        log::warn!("Dropping queued upload {} ({}): {}", task.filename, task.id, reason);
        self.store.remove_from_queue(&task.id).await?;
        self.executor.blobs().release(&task.blob_ref);

        if let (Some(image_id), Variant::Gallery) = (task.image_id.as_deref(), task.variant) {
            match self
                .store
                .update_image_status(image_id, UploadStatus::Failed, None)
                .await
            {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn record_success(&self, task: &QueueTask, url: &str) -> StoreResult<()> {
        self.store.remove_from_queue(&task.id).await?;
        self.executor.blobs().release(&task.blob_ref);

        let Some(image_id) = task.image_id.as_deref() else {
            return Ok(());
        };
        let result = match task.variant {
            Variant::Gallery => {
                self.store
                    .update_image_status(image_id, UploadStatus::Completed, Some(url))
                    .await
            }
            Variant::Pdf => self.store.set_image_pdf_url(image_id, url).await,
        };
        match result {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// One pass over the queue. Concurrent calls run one after the other.
    pub async fn sweep(&self) -> StoreResult<SweepStats> {
        let _guard = self.sweep_lock.lock().await;
        let tasks = self.store.get_queued_tasks().await?;
        let mut stats = SweepStats::default();
        if tasks.is_empty() {
            return Ok(stats);
        }
        log::info!("Resync sweep over {} queued uploads", tasks.len());

        for task in tasks {
            let now = self.clock.now_ms();
            if !self.is_due(&task, now) {
                stats.deferred += 1;
                continue;
            }
            if !self.executor.blobs().contains(&task.blob_ref) {
                self.drop_task(&task, "source no longer available").await?;
                stats.dropped += 1;
                continue;
            }
            if !self.has_credentials(&task).await {
                log::debug!(
                    "Queued upload {} waits for a token in {}",
                    task.filename,
                    task.auth_context.as_deref().unwrap_or_default()
                );
                stats.awaiting_auth += 1;
                continue;
            }

            stats.attempted += 1;
            let mut upload = task.to_upload_task();
            upload.mark_uploading();

            match self.executor.upload_once(&mut upload, &NoopObserver).await {
                Ok(url) => {
                    log::info!("Queued upload {} succeeded", task.filename);
                    self.record_success(&task, &url).await?;
                    stats.uploaded += 1;
                }
                Err(e) if categorize_upload(&e) == ErrorCategory::Client => {
                    self.drop_task(&task, &e.to_string()).await?;
                    stats.dropped += 1;
                }
                Err(e) => {
                    let retries = self
                        .store
                        .update_queue_task_error(&task.id, &e.to_string())
                        .await?;
                    if retries >= self.settings.max_retries {
                        self.drop_task(&task, &format!("gave up after {} retries: {}", retries, e))
                            .await?;
                        stats.dropped += 1;
                    } else {
                        log::debug!(
                            "Queued upload {} failed again ({}/{}): {}",
                            task.filename,
                            retries,
                            self.settings.max_retries,
                            e
                        );
                        stats.rescheduled += 1;
                    }
                }
            }
        }

        self.append_log(SweepLogEntry {
            ts_ms: self.clock.now_ms(),
            stats: stats.clone(),
        });
        log::info!("Resync sweep done: {:?}", stats);
        Ok(stats)
    }

    /// Connectivity came back: sweep right away
    pub async fn on_online(&self) -> StoreResult<SweepStats> {
        log::info!("Back online, resyncing queued uploads");
        self.sweep().await
    }

    /// Runs sweeps every `resync_interval_secs` until `cancel` fires
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Resync loop already running");
            return None;
        }
        let interval = Duration::from_secs(self.settings.resync_interval_secs.max(1));
        log::info!("Starting resync loop with {:?} interval", interval);

        let service = self.clone();
        Some(tokio::spawn(async move {
            loop {
                if let Err(e) = service.sweep().await {
                    log::error!("Resync sweep error: {}", e);
                }
                service
                    .next_sync_at
                    .store(service.clock.now_ms() + interval.as_millis() as i64, Ordering::SeqCst);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            service.running.store(false, Ordering::SeqCst);
            log::info!("Resync loop stopped");
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Seconds until the next periodic sweep, `None` when the loop is stopped
    pub fn next_sync_eta_seconds(&self) -> Option<u64> {
        if !self.is_running() {
            return None;
        }
        let target = self.next_sync_at.load(Ordering::SeqCst);
        let now = self.clock.now_ms();
        if target == 0 || target <= now {
            Some(0)
        } else {
            Some(((target - now) / 1000) as u64)
        }
    }

    fn append_log(&self, entry: SweepLogEntry) {
        if let Ok(mut guard) = self.sweep_log.lock() {
            guard.push(entry);
            let len = guard.len();
            if len > SWEEP_LOG_CAP {
                guard.drain(0..len - SWEEP_LOG_CAP);
            }
        }
    }

    pub fn sweep_log(&self) -> Vec<SweepLogEntry> {
        self.sweep_log.lock().map(|g| g.clone()).unwrap_or_default()
    }
}
