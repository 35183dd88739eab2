//! Bounded upload executor.
//!
//! Tasks are admitted as earlier ones finish, so at most `concurrency`
//! uploads are in flight at any time. Each task gets the attempts allowed
//! by its [`RetryPolicy`]; network and server failures that outlive them go
//! to the durable queue for the resync sweep.

use crate::config::UploadSettings;
use crate::database::DurableStore;
use crate::models::{QueueTask, UploadStatus, UploadTask};
use crate::services::blob_cache::{BlobCache, PreviewRegistry};
use crate::services::error_classifier::{classify_upload, RecoveryStrategy};
use crate::services::retry_policy::RetryPolicy;
use crate::services::transport::{
    CompletedPart, FileUpload, MultipartInit, UploadError, UploadResult, UploadTransport,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Receives task transitions while a batch runs
#[async_trait]
pub trait UploadObserver: Send + Sync {
    /// Called on every status or progress change of a task
    async fn on_task_update(&self, _task: &UploadTask) {}

    /// Called each time a task settles
    async fn on_batch_progress(&self, _completed: usize, _total: usize) {}
}

pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

#[derive(Clone)]
pub struct UploadExecutor {
    transport: Arc<dyn UploadTransport>,
    policy: RetryPolicy,
    concurrency: usize,
    chunk_size: usize,
    multipart_threshold: u64,
    request_timeout: Duration,
    blobs: BlobCache,
    previews: PreviewRegistry,
    queue_store: Option<DurableStore>,
    auth_context: Option<String>,
}

impl UploadExecutor {
    pub fn new(transport: Arc<dyn UploadTransport>, settings: &UploadSettings, blobs: BlobCache) -> Self {
        Self {
            transport,
            policy: RetryPolicy::from(settings),
            concurrency: settings.effective_concurrency(),
            chunk_size: settings.chunk_size.max(1),
            multipart_threshold: settings.multipart_threshold,
            request_timeout: settings.request_timeout(),
            blobs,
            previews: PreviewRegistry::new(),
            queue_store: None,
            auth_context: None,
        }
    }

    /// Durably queue exhausted network/server failures in `store`
    pub fn with_queue(mut self, store: DurableStore, auth_context: Option<String>) -> Self {
        self.queue_store = Some(store);
        self.auth_context = auth_context;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, crate::config::MAX_CONCURRENCY);
        self
    }

    pub fn with_previews(mut self, previews: PreviewRegistry) -> Self {
        self.previews = previews;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn blobs(&self) -> &BlobCache {
        &self.blobs
    }

    pub fn previews(&self) -> &PreviewRegistry {
        &self.previews
    }

    /// Uploads `tasks` and returns them settled, in input order.
    ///
    /// Cancelling `cancel` aborts every outstanding request; tasks that did
    /// not complete come back failed with their previews released.
    pub async fn upload_batch(
        &self,
        tasks: Vec<UploadTask>,
        observer: Arc<dyn UploadObserver>,
        cancel: &CancellationToken,
    ) -> Vec<UploadTask> {
        let total = tasks.len();
        for task in &tasks {
            self.previews.register(&task.id);
        }

        let mut results: Vec<Option<UploadTask>> = vec![None; total];
        let mut join_set: JoinSet<(usize, UploadTask)> = JoinSet::new();
        let mut next = 0;
        let mut completed = 0;
        let mut cancelled = false;

        log::info!(
            "Uploading batch of {} tasks with concurrency {}",
            total,
            self.concurrency
        );

        loop {
            while !cancelled && join_set.len() < self.concurrency && next < total {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let index = next;
                let task = tasks[index].clone();
                let executor = self.clone();
                let observer = observer.clone();
                join_set.spawn(async move { (index, executor.upload_with_retry(task, observer.as_ref()).await) });
                next += 1;
            }

            if cancelled || join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Upload batch cancelled, aborting {} requests", join_set.len());
                    cancelled = true;
                    join_set.abort_all();
                }
                joined = join_set.join_next() => match joined {
                    Some(Ok((index, task))) => {
                        results[index] = Some(task);
                        completed += 1;
                        observer.on_batch_progress(completed, total).await;
                    }
                    Some(Err(e)) => log::error!("Upload task join error: {}", e),
                    None => break,
                },
            }
        }

        // Aborted tasks resolve with a JoinError; those that raced to
        // completion still count
        while let Some(joined) = join_set.join_next().await {
            if let Ok((index, task)) = joined {
                results[index] = Some(task);
                completed += 1;
                observer.on_batch_progress(completed, total).await;
            }
        }

        let mut settled = Vec::with_capacity(total);
        for (slot, original) in results.into_iter().zip(tasks) {
            match slot {
                Some(task) => settled.push(task),
                None => {
                    let mut task = original;
                    task.mark_failed(if cancelled {
                        UploadError::Cancelled.to_string()
                    } else {
                        "Upload task aborted".to_string()
                    });
                    self.previews.release(&task.id);
                    self.blobs.release(&task.source);
                    observer.on_task_update(&task).await;
                    settled.push(task);
                }
            }
        }

        let failed = settled
            .iter()
            .filter(|t| t.status == UploadStatus::Failed)
            .count();
        log::info!(
            "Upload batch finished: {} completed, {} failed",
            total - failed,
            failed
        );
        settled
    }

    /// Runs one task to a terminal state under the retry policy
    pub async fn upload_with_retry(&self, mut task: UploadTask, observer: &dyn UploadObserver) -> UploadTask {
        task.mark_uploading();
        observer.on_task_update(&task).await;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.upload_once(&mut task, observer).await {
                Ok(url) => {
                    log::debug!("Uploaded {} after {} attempt(s)", task.filename, attempts);
                    task.mark_completed(url);
                    break;
                }
                Err(e) => {
                    let classification = classify_upload(&e);
                    if classification.retryable && self.policy.has_attempts_left(attempts) {
                        let delay = self.policy.backoff(attempts);
                        log::warn!(
                            "Upload of {} failed (attempt {}/{}), retrying in {:?}: {}",
                            task.filename,
                            attempts,
                            self.policy.max_attempts,
                            delay,
                            e
                        );
                        task.retries += 1;
                        task.error = Some(e.to_string());
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    log::error!(
                        "Upload of {} failed permanently ({}): {}",
                        task.filename,
                        classification.category.as_str(),
                        e
                    );
                    task.mark_failed(e.to_string());
                    task.error_category = Some(classification.category.as_str().to_string());
                    if classification.strategy == RecoveryStrategy::QueueForBackgroundRetry {
                        self.enqueue(&mut task).await;
                    }
                    break;
                }
            }
        }

        self.previews.release(&task.id);
        if !task.queued {
            self.blobs.release(&task.source);
        }
        observer.on_task_update(&task).await;
        task
    }

    /// A single attempt; no retries, no queueing. Every request of the
    /// attempt is bounded by the request timeout on its own.
    pub async fn upload_once(&self, task: &mut UploadTask, observer: &dyn UploadObserver) -> UploadResult<String> {
        self.send(task, observer).await
    }

    async fn bounded<T, F>(&self, request: F) -> UploadResult<T>
    where
        F: std::future::Future<Output = UploadResult<T>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::Timeout),
        }
    }

    async fn send(&self, task: &mut UploadTask, observer: &dyn UploadObserver) -> UploadResult<String> {
        let size = self.blobs.size_of(&task.source).await?;
        if size > self.multipart_threshold {
            return self.send_multipart(task, size, observer).await;
        }

        let bytes = self.blobs.resolve(&task.source).await?;
        self.bounded(self.transport.upload_file(FileUpload {
            filename: task.filename.clone(),
            content_type: task.content_type.clone(),
            bytes: bytes.as_ref().clone(),
            destination: task.destination.clone(),
        }))
        .await
    }

    async fn send_multipart(
        &self,
        task: &mut UploadTask,
        size: u64,
        observer: &dyn UploadObserver,
    ) -> UploadResult<String> {
        let chunk_size = self.chunk_size as u64;
        let total_chunks = size.div_ceil(chunk_size) as usize;

        let init = MultipartInit {
            filename: task.filename.clone(),
            content_type: task.content_type.clone(),
            entity_id: task.destination.entity_id.clone(),
            media_type: task.destination.media_type.clone(),
            total_chunks,
        };
        let session = self.bounded(self.transport.init_multipart(&init)).await?;
        if session.urls.len() < total_chunks {
            return Err(UploadError::InvalidResponse(format!(
                "expected {} chunk urls, got {}",
                total_chunks,
                session.urls.len()
            )));
        }

        let mut parts = Vec::with_capacity(total_chunks);
        for (index, url) in session.urls.iter().take(total_chunks).enumerate() {
            let part_number = index as u32 + 1;
            let chunk = self
                .blobs
                .read_range(&task.source, index as u64 * chunk_size, self.chunk_size)
                .await?;
            let e_tag = self
                .bounded(self.transport.upload_part(url, part_number, chunk))
                .await?;
            parts.push(CompletedPart { part_number, e_tag });

            // 100 is reserved for the confirmed completion
            task.advance_progress(((index + 1) * 99 / total_chunks) as u8);
            observer.on_task_update(task).await;
        }

        self.bounded(self.transport.complete_multipart(&session.upload_id, &parts))
            .await
    }

    async fn enqueue(&self, task: &mut UploadTask) {
        let Some(store) = &self.queue_store else {
            return;
        };
        let queued = QueueTask::from_upload(task, self.auth_context.clone());
        match store.add_to_queue(&queued).await {
            Ok(_) => task.queued = true,
            Err(e) => log::error!("Could not queue {} for retry: {}", task.filename, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{BlobRef, Destination};
    use crate::services::transport::MultipartSession;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    pub(crate) enum FailKind {
        Server,
        Network,
        Unauthorized,
        OutOfMemory,
    }

    impl FailKind {
        fn error(&self) -> UploadError {
            match self {
                FailKind::Server => UploadError::Http {
                    status: 503,
                    message: "unavailable".into(),
                },
                FailKind::Network => UploadError::Network("connection reset".into()),
                FailKind::Unauthorized => UploadError::Http {
                    status: 401,
                    message: "unauthorized".into(),
                },
                FailKind::OutOfMemory => UploadError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "out of memory",
                )),
            }
        }
    }

    /// Scripted transport: per filename, a number of failures before success
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub failures: Mutex<HashMap<String, (u32, FailKind)>>,
        pub fail_all: Mutex<Option<FailKind>>,
        pub delay: Duration,
        pub attempts: Mutex<HashMap<String, u32>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub part_sizes: Mutex<Vec<(u32, usize)>>,
        pub part_delay: Duration,
        pub uploaded: Mutex<Vec<(String, usize)>>,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FakeTransport {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        pub fn fail(&self, filename: &str, times: u32, kind: FailKind) {
            self.failures
                .lock()
                .unwrap()
                .insert(filename.to_string(), (times, kind));
        }

        pub fn fail_everything(&self, kind: FailKind) {
            *self.fail_all.lock().unwrap() = Some(kind);
        }

        pub fn attempts_for(&self, filename: &str) -> u32 {
            self.attempts.lock().unwrap().get(filename).copied().unwrap_or(0)
        }

        fn enter(&self) -> InFlight<'_> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            InFlight(&self.in_flight)
        }

        fn next_failure(&self, filename: &str) -> Option<UploadError> {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(filename.to_string())
                .or_insert(0) += 1;
            if let Some(kind) = *self.fail_all.lock().unwrap() {
                return Some(kind.error());
            }
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(filename) {
                Some((remaining, kind)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(kind.error())
                }
                _ => None,
            }
        }
    }

    #[async_trait]
    impl UploadTransport for FakeTransport {
        async fn upload_file(&self, request: FileUpload) -> UploadResult<String> {
            let _guard = self.enter();
            tokio::time::sleep(self.delay).await;
            if let Some(error) = self.next_failure(&request.filename) {
                return Err(error);
            }
            self.uploaded
                .lock()
                .unwrap()
                .push((request.filename.clone(), request.bytes.len()));
            Ok(format!("https://cdn.test/{}", request.filename))
        }

        async fn init_multipart(&self, request: &MultipartInit) -> UploadResult<MultipartSession> {
            if let Some(error) = self.next_failure(&request.filename) {
                return Err(error);
            }
            Ok(MultipartSession {
                upload_id: format!("mp-{}", request.filename),
                urls: (1..=request.total_chunks)
                    .map(|i| format!("https://chunks.test/{}/{}", request.filename, i))
                    .collect(),
            })
        }

        async fn upload_part(&self, _url: &str, part_number: u32, bytes: Vec<u8>) -> UploadResult<String> {
            let _guard = self.enter();
            tokio::time::sleep(self.part_delay).await;
            self.part_sizes.lock().unwrap().push((part_number, bytes.len()));
            Ok(format!("etag-{}", part_number))
        }

        async fn complete_multipart(&self, upload_id: &str, parts: &[CompletedPart]) -> UploadResult<String> {
            Ok(format!("https://cdn.test/{}/{}", upload_id, parts.len()))
        }
    }

    /// Records every update it sees
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub updates: Mutex<Vec<UploadTask>>,
        pub progress: Mutex<Vec<(usize, usize)>>,
        uploading: AtomicUsize,
        pub max_uploading: AtomicUsize,
    }

    #[async_trait]
    impl UploadObserver for RecordingObserver {
        async fn on_task_update(&self, task: &UploadTask) {
            let mut updates = self.updates.lock().unwrap();
            let was_uploading = updates
                .iter()
                .rev()
                .find(|t| t.id == task.id)
                .map(|t| t.status == UploadStatus::Uploading)
                .unwrap_or(false);
            match (was_uploading, task.status == UploadStatus::Uploading) {
                (false, true) => {
                    let now = self.uploading.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_uploading.fetch_max(now, Ordering::SeqCst);
                }
                (true, false) => {
                    self.uploading.fetch_sub(1, Ordering::SeqCst);
                }
                _ => {}
            }
            updates.push(task.clone());
        }

        async fn on_batch_progress(&self, completed: usize, total: usize) {
            self.progress.lock().unwrap().push((completed, total));
        }
    }

    pub(crate) fn fast_settings(concurrency: usize) -> UploadSettings {
        UploadSettings {
            concurrency,
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..UploadSettings::default()
        }
    }

    fn tasks(blobs: &BlobCache, count: usize) -> Vec<UploadTask> {
        (0..count)
            .map(|i| {
                UploadTask::new(
                    blobs.insert(vec![i as u8; 64]),
                    format!("photo-{}.webp", i),
                    "image/webp",
                    Destination::protocol("p-1", "vehicle"),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_retry_then_success_within_concurrency_bound() {
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_millis(10)));
        transport.fail("photo-2.webp", 2, FailKind::Server);
        let blobs = BlobCache::new();
        let executor = UploadExecutor::new(transport.clone(), &fast_settings(2), blobs.clone());
        let observer = Arc::new(RecordingObserver::default());

        let results = executor
            .upload_batch(tasks(&blobs, 5), observer.clone(), &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|t| t.status == UploadStatus::Completed));
        assert_eq!(results[2].retries, 2);
        assert_eq!(results[0].retries, 0);
        assert_eq!(transport.attempts_for("photo-2.webp"), 3);
        assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert!(observer.max_uploading.load(Ordering::SeqCst) <= 2);
        assert_eq!(observer.progress.lock().unwrap().last(), Some(&(5, 5)));
        assert!(blobs.is_empty());
        assert_eq!(executor.previews().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_network_failure_is_queued_after_exactly_max_attempts() {
        let store = DurableStore::in_memory();
        let transport = Arc::new(FakeTransport::default());
        transport.fail("photo-0.webp", u32::MAX, FailKind::Network);
        let blobs = BlobCache::new();
        let executor = UploadExecutor::new(transport.clone(), &fast_settings(2), blobs.clone())
            .with_queue(store.clone(), Some("auth.token".into()));

        let task = tasks(&blobs, 1).remove(0);
        let source = task.source.clone();
        let result = executor.upload_with_retry(task, &NoopObserver).await;

        assert_eq!(result.status, UploadStatus::Failed);
        assert_eq!(transport.attempts_for("photo-0.webp"), 3);
        assert_eq!(result.retries, 2);
        assert!(result.queued);
        // Queued tasks keep their bytes for the resync sweep
        assert!(blobs.contains(&source));

        let queued = store.get_queued_tasks().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].blob_ref, source);
        assert_eq!(queued[0].auth_context.as_deref(), Some("auth.token"));
    }

    #[tokio::test]
    async fn test_client_error_is_never_retried() {
        let store = DurableStore::in_memory();
        let transport = Arc::new(FakeTransport::default());
        transport.fail("photo-0.webp", u32::MAX, FailKind::Unauthorized);
        let blobs = BlobCache::new();
        let executor = UploadExecutor::new(transport.clone(), &fast_settings(2), blobs.clone())
            .with_queue(store.clone(), None);

        let result = executor
            .upload_with_retry(tasks(&blobs, 1).remove(0), &NoopObserver)
            .await;

        assert_eq!(result.status, UploadStatus::Failed);
        assert_eq!(transport.attempts_for("photo-0.webp"), 1);
        assert_eq!(result.error_category.as_deref(), Some("client"));
        assert!(!result.queued);
        assert!(blobs.is_empty());
        assert!(store.get_queued_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_payload_goes_multipart_with_monotone_progress() {
        let transport = Arc::new(FakeTransport::default());
        let blobs = BlobCache::new();
        let settings = UploadSettings {
            chunk_size: 4,
            multipart_threshold: 5,
            ..fast_settings(2)
        };
        let executor = UploadExecutor::new(transport.clone(), &settings, blobs.clone());
        let observer = RecordingObserver::default();

        let task = UploadTask::new(
            blobs.insert((0..10).collect()),
            "big.webp",
            "image/webp",
            Destination::protocol("p-1", "vehicle"),
        );
        let result = executor.upload_with_retry(task, &observer).await;

        assert_eq!(result.status, UploadStatus::Completed);
        assert_eq!(result.url.as_deref(), Some("https://cdn.test/mp-big.webp/3"));
        assert_eq!(
            *transport.part_sizes.lock().unwrap(),
            vec![(1, 4), (2, 4), (3, 2)]
        );

        let progress: Vec<u8> = observer
            .updates
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.status == UploadStatus::Uploading)
            .map(|t| t.progress)
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(observer.updates.lock().unwrap().last().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_request_timeout_applies_per_part_not_per_file() {
        let transport = Arc::new(FakeTransport {
            part_delay: Duration::from_millis(400),
            ..FakeTransport::default()
        });
        let blobs = BlobCache::new();
        let settings = UploadSettings {
            chunk_size: 4,
            multipart_threshold: 4,
            request_timeout_secs: 1,
            ..fast_settings(1)
        };
        let executor = UploadExecutor::new(transport.clone(), &settings, blobs.clone());
        let task = UploadTask::new(
            blobs.insert(vec![5u8; 16]),
            "slow.webp",
            "image/webp",
            Destination::protocol("p-1", "vehicle"),
        );

        let result = executor.upload_with_retry(task, &NoopObserver).await;
        assert_eq!(result.status, UploadStatus::Completed, "{:?}", result.error);
        assert_eq!(result.retries, 0);
        assert_eq!(transport.part_sizes.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_single_slow_part_times_out() {
        let transport = Arc::new(FakeTransport {
            part_delay: Duration::from_millis(1500),
            ..FakeTransport::default()
        });
        let blobs = BlobCache::new();
        let settings = UploadSettings {
            chunk_size: 4,
            multipart_threshold: 4,
            request_timeout_secs: 1,
            max_attempts: 1,
            ..fast_settings(1)
        };
        let executor = UploadExecutor::new(transport, &settings, blobs.clone());
        let mut task = UploadTask::new(
            blobs.insert(vec![5u8; 8]),
            "stuck.webp",
            "image/webp",
            Destination::protocol("p-1", "vehicle"),
        );

        let result = executor.upload_once(&mut task, &NoopObserver).await;
        assert!(matches!(result, Err(UploadError::Timeout)));
    }

    #[tokio::test]
    async fn test_file_source_is_chunked_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.jpg");
        std::fs::write(&path, vec![9u8; 25]).unwrap();

        let transport = Arc::new(FakeTransport::default());
        let settings = UploadSettings {
            chunk_size: 10,
            multipart_threshold: 10,
            ..fast_settings(1)
        };
        let executor = UploadExecutor::new(transport.clone(), &settings, BlobCache::new());
        let task = UploadTask::new(
            BlobRef::File(path.clone()),
            "scan.jpg",
            "image/jpeg",
            Destination::protocol("p-1", "document"),
        );

        let result = executor.upload_with_retry(task, &NoopObserver).await;
        assert_eq!(result.status, UploadStatus::Completed);
        assert_eq!(
            *transport.part_sizes.lock().unwrap(),
            vec![(1, 10), (2, 10), (3, 5)]
        );
        // File sources are not owned by the executor
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_retry() {
        let transport = Arc::new(FakeTransport::default());
        let executor = UploadExecutor::new(transport.clone(), &fast_settings(2), BlobCache::new());
        let task = UploadTask::new(
            BlobRef::Memory("gone".into()),
            "gone.webp",
            "image/webp",
            Destination::protocol("p-1", "vehicle"),
        );
        let result = executor.upload_with_retry(task, &NoopObserver).await;
        assert_eq!(result.status, UploadStatus::Failed);
        assert_eq!(result.retries, 0);
        assert!(transport.uploaded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_and_releases_previews() {
        let transport = Arc::new(FakeTransport::with_delay(Duration::from_secs(30)));
        let blobs = BlobCache::new();
        let executor = UploadExecutor::new(transport.clone(), &fast_settings(2), blobs.clone());
        let observer = Arc::new(RecordingObserver::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let watched = transport.clone();
        tokio::spawn(async move {
            while watched.in_flight.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
            trigger.cancel();
        });

        let results = executor
            .upload_batch(tasks(&blobs, 10), observer.clone(), &cancel)
            .await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|t| t.status == UploadStatus::Failed));
        assert!(results
            .iter()
            .all(|t| t.error.as_deref() == Some("Upload cancelled")));
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(executor.previews().outstanding(), 0);
        assert!(blobs.is_empty());
        cancel.cancel();
    }
}
