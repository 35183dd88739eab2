//! Streaming pipeline: photos go through transform, upload and persistence
//! one batch at a time, so only a batch worth of buffers is alive at once.

use crate::database::DurableStore;
use crate::error::CaptureError;
use crate::models::{
    BlobRef, Destination, ImageMetadata, ProtocolDraft, ProtocolImage, UploadStatus, UploadTask,
    Variant,
};
use crate::services::capability_service::CapabilityEstimator;
use crate::services::error_classifier::{
    classify_transform, Classification, ErrorCategory, RecoveryStrategy,
};
use crate::services::pdf_service::PdfCache;
use crate::services::recovery_service;
use crate::services::upload_service::{UploadExecutor, UploadObserver};
use async_trait::async_trait;
use capture_imaging::{
    batch_concurrency, BatchOutcome, GpsPoint, QualityTier, SourceImage, TransformWorker,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_BATCH_SIZE: usize = 2;
const MAX_BATCH_SIZE: usize = 6;

/// Per-run settings supplied by the caller
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Protocol the photos belong to
    pub owner_id: String,
    pub protocol_type: String,
    pub media_type: String,
    /// Taken from the capability estimate when `None`
    pub batch_size: Option<usize>,
    pub quality: Option<QualityTier>,
    /// Form fields to checkpoint with the draft
    pub form_snapshot: Option<serde_json::Value>,
}

impl StreamOptions {
    pub fn new(owner_id: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            protocol_type: "handover".to_string(),
            media_type: media_type.into(),
            batch_size: None,
            quality: None,
            form_snapshot: None,
        }
    }
}

/// UI-facing notifications of a run
pub trait StreamCallbacks: Send + Sync {
    /// `completed` never decreases within one run
    fn on_progress(&self, _completed: usize, _total: usize, _message: &str) {}

    fn on_complete(&self, _urls: &[String]) {}

    fn on_error(&self, _filename: &str, _classification: &Classification) {}
}

pub struct NoopCallbacks;

impl StreamCallbacks for NoopCallbacks {}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub total: usize,
    pub uploaded: usize,
    pub transform_failures: usize,
    pub upload_failures: usize,
    /// Batches that failed as a whole (worker unavailable)
    pub failed_batches: usize,
    pub batches: usize,
    pub initial_batch_size: usize,
    pub final_batch_size: usize,
    /// Draft checkpoints forced by failures that cannot be recovered
    pub abort_checkpoints: usize,
    /// Resident set high-water mark in KiB, when the platform reports it
    pub peak_memory_kb: Option<u64>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StreamResult {
    pub images: Vec<ProtocolImage>,
    pub stats: StreamStats,
}

/// Best effort peak memory of this process
pub fn peak_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status
        .lines()
        .find(|l| l.starts_with("VmHWM:"))
        .or_else(|| status.lines().find(|l| l.starts_with("VmRSS:")))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Settled-unit counter. Counting and reporting happen under one lock so
/// concurrent uploads cannot report out of order.
struct Progress {
    callbacks: Arc<dyn StreamCallbacks>,
    completed: Mutex<usize>,
    total: usize,
}

impl Progress {
    fn report(&self, message: &str) {
        if let Ok(completed) = self.completed.lock() {
            self.callbacks.on_progress(*completed, self.total, message);
        }
    }

    fn advance(&self, message: &str) {
        if let Ok(mut completed) = self.completed.lock() {
            *completed = (*completed + 1).min(self.total);
            self.callbacks.on_progress(*completed, self.total, message);
        }
    }
}

/// Mirrors task transitions into the `images` table
struct StoreObserver {
    store: DurableStore,
    progress: Arc<Progress>,
}

#[async_trait]
impl UploadObserver for StoreObserver {
    async fn on_task_update(&self, task: &UploadTask) {
        let Some(image_id) = task.image_id.as_deref() else {
            return;
        };

        match task.variant {
            Variant::Gallery => {
                let result = self
                    .store
                    .update_image_status(image_id, task.status, task.url.as_deref())
                    .await;
                if let Err(e) = result {
                    log::warn!("Could not record status of image {}: {}", image_id, e);
                }

                if task.status.is_terminal() {
                    let message = match task.status {
                        UploadStatus::Completed => format!("Uploaded {}", task.filename),
                        _ => format!("Failed to upload {}", task.filename),
                    };
                    self.progress.advance(&message);
                }
            }
            Variant::Pdf => {
                if let (UploadStatus::Completed, Some(url)) = (task.status, task.url.as_deref()) {
                    if let Err(e) = self.store.set_image_pdf_url(image_id, url).await {
                        log::warn!("Could not record PDF url of image {}: {}", image_id, e);
                    }
                }
            }
        }
    }
}

/// The transform stage as the orchestrator drives it
#[async_trait]
pub trait ImageTransformer: Send + Sync {
    /// Threads doing transforms, used to size the in-batch bound
    fn threads(&self) -> usize;

    async fn transform_batch(
        &self,
        files: Vec<SourceImage>,
        quality: QualityTier,
        bound: usize,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> BatchOutcome;
}

#[async_trait]
impl ImageTransformer for TransformWorker {
    fn threads(&self) -> usize {
        self.config().threads
    }

    async fn transform_batch(
        &self,
        files: Vec<SourceImage>,
        quality: QualityTier,
        bound: usize,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> BatchOutcome {
        self.process_batch(files, quality, bound, |done, total| on_progress(done, total))
            .await
    }
}

/// One transformed image waiting for its uploads
struct Staged {
    id: String,
    filename: String,
    original_size: usize,
    compressed_size: usize,
    width: u32,
    height: u32,
    gps: Option<GpsPoint>,
    timestamp: i64,
}

pub struct StreamOrchestrator {
    store: DurableStore,
    worker: Arc<dyn ImageTransformer>,
    executor: UploadExecutor,
    estimator: Option<Arc<CapabilityEstimator>>,
    pdf_cache: Option<PdfCache>,
}

impl StreamOrchestrator {
    pub fn new(
        store: DurableStore,
        worker: impl ImageTransformer + 'static,
        executor: UploadExecutor,
    ) -> Self {
        Self {
            store,
            worker: Arc::new(worker),
            executor,
            estimator: None,
            pdf_cache: None,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<CapabilityEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// PDF derivatives are written here and uploaded from disk
    pub fn with_pdf_cache(mut self, cache: PdfCache) -> Self {
        self.pdf_cache = Some(cache);
        self
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    /// Runs `files` through the pipeline.
    ///
    /// Only a store that cannot be initialised is an error; unit and batch
    /// failures end up in the stats. Cancelling `cancel` stops the run,
    /// aborts outstanding uploads and marks their rows failed.
    pub async fn process_stream(
        &self,
        files: Vec<SourceImage>,
        options: StreamOptions,
        callbacks: Arc<dyn StreamCallbacks>,
        cancel: &CancellationToken,
    ) -> Result<StreamResult, CaptureError> {
        self.store.init().await?;
        let started = Instant::now();
        let owner = options.owner_id.clone();
        let total = files.len();

        let capabilities = match &self.estimator {
            Some(estimator) if options.batch_size.is_none() || options.quality.is_none() => {
                Some(estimator.detect(false).await)
            }
            _ => None,
        };
        let mut batch_size = options
            .batch_size
            .or_else(|| capabilities.as_ref().map(|c| c.recommended_batch_size))
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .clamp(1, MAX_BATCH_SIZE);
        let quality = options
            .quality
            .or_else(|| capabilities.as_ref().map(|c| c.recommended_quality))
            .unwrap_or(QualityTier::Protocol);
        let memory_constrained = capabilities
            .as_ref()
            .map(|c| c.memory_constrained)
            .unwrap_or(false);
        let transform_bound = batch_concurrency(memory_constrained, self.worker.threads());

        let mut stats = StreamStats {
            total,
            initial_batch_size: batch_size,
            ..StreamStats::default()
        };
        log::info!(
            "Streaming {} photos for {} (batch size {}, quality {})",
            total,
            owner,
            batch_size,
            quality
        );

        if let Err(e) = recovery_service::mark_active_protocol(&self.store, &owner).await {
            log::warn!("Could not record active protocol: {}", e);
        }
        let mut draft = self.open_draft(&options, total).await;

        let progress = Arc::new(Progress {
            callbacks: callbacks.clone(),
            completed: Mutex::new(0),
            total,
        });
        let observer = Arc::new(StoreObserver {
            store: self.store.clone(),
            progress: progress.clone(),
        });

        let mut images = Vec::new();
        let mut remaining = files.into_iter();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let batch: Vec<SourceImage> = remaining.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            stats.batches += 1;
            let batch_len = batch.len();
            let batch_number = stats.batches;

            // transform
            let inputs = batch.clone();
            let report = |done: usize, n: usize| {
                progress.report(&format!(
                    "Processing photo {} of {} in batch {}",
                    done, n, batch_number
                ));
            };
            let mut outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                outcome = self.worker.transform_batch(batch, quality, transform_bound, &report) => outcome,
            };

            // timed-out units get one immediate second attempt
            let retry_indices: Vec<usize> = outcome
                .failures
                .iter()
                .filter(|f| classify_transform(&f.error).strategy == RecoveryStrategy::RetryImmediately)
                .map(|f| f.index)
                .collect();
            if !retry_indices.is_empty() {
                outcome.failures.retain(|f| !retry_indices.contains(&f.index));
                let retry: Vec<SourceImage> = inputs
                    .into_iter()
                    .enumerate()
                    .filter(|(index, _)| retry_indices.contains(index))
                    .map(|(_, source)| source)
                    .collect();
                log::info!(
                    "Retrying {} timed out transforms of batch {}",
                    retry.len(),
                    batch_number
                );

                let second = tokio::select! {
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    second = self.worker.transform_batch(retry, quality, transform_bound, &|_: usize, _: usize| {}) => second,
                };
                for (index, image) in second.successes {
                    if let Some(&original) = retry_indices.get(index) {
                        outcome.successes.push((original, image));
                    }
                }
                for mut failure in second.failures {
                    if let Some(&original) = retry_indices.get(failure.index) {
                        failure.index = original;
                    }
                    outcome.failures.push(failure);
                }
                outcome.successes.sort_by_key(|(index, _)| *index);
                outcome.failures.sort_by_key(|f| f.index);
            } else {
                drop(inputs);
            }

            if outcome.worker_unavailable() {
                log::error!(
                    "Batch {} failed: transform worker unavailable",
                    batch_number
                );
                stats.failed_batches += 1;
            }

            let mut shrink = false;
            let mut abort_checkpoint = false;
            for failure in &outcome.failures {
                stats.transform_failures += 1;
                let classification = classify_transform(&failure.error);
                match classification.strategy {
                    RecoveryStrategy::ShrinkBatch => shrink = true,
                    RecoveryStrategy::AbortAndCheckpoint => abort_checkpoint = true,
                    _ => {}
                }
                callbacks.on_error(&failure.filename, &classification);
                progress.advance(&format!("Could not process {}", failure.filename));
            }
            if abort_checkpoint {
                log::warn!("Unrecoverable transform failure in batch {}, checkpointing draft", batch_number);
                stats.abort_checkpoints += 1;
                self.checkpoint(&mut draft).await;
            }

            // upload
            let mut staged = Vec::with_capacity(outcome.successes.len());
            let mut tasks = Vec::with_capacity(outcome.successes.len() * 2);
            for (_, processed) in outcome.successes {
                let id = uuid::Uuid::new_v4().to_string();
                let checksum = format!("{:x}", Sha256::digest(&processed.gallery.bytes));
                let destination = Destination {
                    record_type: "protocol".to_string(),
                    entity_id: owner.clone(),
                    protocol_type: options.protocol_type.clone(),
                    media_type: options.media_type.clone(),
                };

                let mut row = ImageMetadata::new(&id, &owner, &processed.filename, &options.media_type);
                row.size = processed.gallery.size as u64;
                row.checksum = Some(checksum);
                if let Err(e) = self.store.save_image(&row).await {
                    log::warn!("Could not record image {}: {}", processed.filename, e);
                }

                let pdf_source = match &self.pdf_cache {
                    Some(cache) => match cache.put(&owner, &id, &processed.pdf.bytes).await {
                        Ok(path) => BlobRef::File(path),
                        Err(e) => {
                            log::warn!("PDF cache write failed for {}: {}", id, e);
                            self.executor.blobs().insert(processed.pdf.bytes)
                        }
                    },
                    None => self.executor.blobs().insert(processed.pdf.bytes),
                };
                let gallery_source = self.executor.blobs().insert(processed.gallery.bytes);

                tasks.push(
                    UploadTask::new(gallery_source, format!("{}.webp", id), "image/webp", destination.clone())
                        .for_image(&id, Variant::Gallery),
                );
                tasks.push(
                    UploadTask::new(pdf_source, format!("{}_pdf.jpg", id), "image/jpeg", destination)
                        .for_image(&id, Variant::Pdf),
                );
                staged.push(Staged {
                    id,
                    filename: processed.filename,
                    original_size: processed.metadata.original_size,
                    compressed_size: processed.gallery.size,
                    width: processed.gallery.width,
                    height: processed.gallery.height,
                    gps: processed.metadata.gps,
                    timestamp: processed.metadata.timestamp,
                });
            }

            let settled = if tasks.is_empty() {
                Vec::new()
            } else {
                self.executor.upload_batch(tasks, observer.clone(), cancel).await
            };

            let mut upload_abort = false;
            for task in settled.iter().filter(|t| t.status == UploadStatus::Failed) {
                let Some(category) = task.error_category.as_deref().map(ErrorCategory::from_str) else {
                    continue;
                };
                match category.strategy() {
                    RecoveryStrategy::ShrinkBatch => shrink = true,
                    RecoveryStrategy::AbortAndCheckpoint => upload_abort = true,
                    _ => {}
                }
            }
            if upload_abort {
                stats.abort_checkpoints += 1;
            }

            // persist
            let mut confirmed = Vec::new();
            for image in staged {
                let gallery = settled
                    .iter()
                    .find(|t| t.image_id.as_deref() == Some(image.id.as_str()) && t.variant == Variant::Gallery);
                let pdf = settled
                    .iter()
                    .find(|t| t.image_id.as_deref() == Some(image.id.as_str()) && t.variant == Variant::Pdf);

                match gallery {
                    Some(task) if task.status == UploadStatus::Completed => {
                        let url = task.url.clone().unwrap_or_default();
                        confirmed.push(image.id.clone());
                        images.push(ProtocolImage {
                            id: image.id,
                            url,
                            pdf_url: pdf
                                .filter(|t| t.status == UploadStatus::Completed)
                                .and_then(|t| t.url.clone()),
                            media_type: options.media_type.clone(),
                            filename: image.filename,
                            original_size: image.original_size,
                            compressed_size: image.compressed_size,
                            width: image.width,
                            height: image.height,
                            gps: image.gps,
                            timestamp: image.timestamp,
                        });
                    }
                    _ => {
                        stats.upload_failures += 1;
                        log::warn!(
                            "Upload of {} failed: {}",
                            image.filename,
                            gallery.and_then(|t| t.error.as_deref()).unwrap_or("unknown")
                        );
                    }
                }
            }
            stats.uploaded += confirmed.len();

            draft.record_uploaded(confirmed);
            self.checkpoint(&mut draft).await;

            // release; the executor already dropped uploaded buffers
            drop(settled);

            if shrink && batch_size > 1 {
                batch_size = (batch_size / 2).max(1);
                log::warn!("Memory pressure, shrinking batch size to {}", batch_size);
            }

            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            progress.report(&format!("Batch {} done ({} photos)", batch_number, batch_len));
        }

        if cancelled {
            log::info!("Stream for {} cancelled", owner);
            match self.store.mark_in_flight_failed(Some(&owner)).await {
                Ok(_) => {}
                Err(e) => log::error!("Could not clear in-flight rows for {}: {}", owner, e),
            }
            let skipped = remaining.count();
            if skipped > 0 {
                log::info!("{} photos were not processed", skipped);
            }
        }

        stats.cancelled = cancelled;
        stats.final_batch_size = batch_size;
        stats.peak_memory_kb = peak_memory_kb();
        stats.duration_ms = started.elapsed().as_millis() as u64;

        log::info!(
            "Stream for {} finished: {} uploaded, {} transform failures, {} upload failures in {} batches",
            owner,
            stats.uploaded,
            stats.transform_failures,
            stats.upload_failures,
            stats.batches
        );

        if !cancelled {
            let urls: Vec<String> = images.iter().map(|i| i.url.clone()).collect();
            callbacks.on_complete(&urls);
        }

        Ok(StreamResult { images, stats })
    }

    /// Forgets the draft and the active protocol once the protocol is submitted
    pub async fn finalize(&self, owner_id: &str) -> Result<(), CaptureError> {
        self.store.delete_draft(owner_id).await?;
        recovery_service::clear_active_protocol(&self.store, owner_id).await?;
        Ok(())
    }

    async fn checkpoint(&self, draft: &mut ProtocolDraft) {
        match self.store.save_draft(draft).await {
            Ok(saved) => *draft = saved,
            Err(e) => log::warn!("Could not checkpoint draft {}: {}", draft.protocol_id, e),
        }
    }

    async fn open_draft(&self, options: &StreamOptions, new_files: usize) -> ProtocolDraft {
        let existing = match self.store.get_draft(&options.owner_id).await {
            Ok(draft) => draft,
            Err(e) => {
                log::warn!("Could not read draft {}: {}", options.owner_id, e);
                None
            }
        };

        let mut draft = match existing {
            Some(mut draft) => {
                draft.total_count = draft.uploaded_count + new_files as u32;
                draft
            }
            None => ProtocolDraft::new(&options.owner_id, new_files as u32),
        };
        if let Some(form) = &options.form_snapshot {
            draft.form_data = form.clone();
        }

        match self.store.save_draft(&draft).await {
            Ok(saved) => saved,
            Err(e) => {
                log::warn!("Could not checkpoint draft {}: {}", options.owner_id, e);
                draft
            }
        }
    }
}
