//! # Protocol Capture
//!
//! Photo pipeline for rental handover and return protocols:
//! - Capability estimate picks batch size and quality tier
//! - Streaming orchestrator runs transform, upload and persistence per batch
//! - Bounded upload executor with retry, multipart and a durable retry queue
//! - Crash detection via heartbeat, background resync of queued uploads
//! - Protocol PDF assembly with tiered image sourcing
//!
//! Image decoding, encoding and PDF writing live in `capture-imaging`.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod services;

pub use config::CaptureConfig;
pub use database::{DurableStore, StoreError, StoreLocation};
pub use error::CaptureError;

use capture_imaging::{TransformOptions, TransformWorker, WorkerConfig};
use services::auth::AUTH_TOKEN_KEY;
use services::recovery_service::SystemClock;
use services::{
    AuthTokens, BlobCache, CapabilityEstimator, HttpTransport, PdfCache, ProtocolPdfService,
    RecoveryService, ResyncService, StreamOrchestrator, UploadExecutor,
};
use std::sync::Arc;
use std::time::Duration;

/// The wired-up pipeline for one process
pub struct CaptureServices {
    pub config: CaptureConfig,
    pub store: DurableStore,
    pub tokens: AuthTokens,
    pub executor: UploadExecutor,
    pub estimator: Arc<CapabilityEstimator>,
    pub recovery: RecoveryService,
    pub resync: Arc<ResyncService>,
    pub pdf: ProtocolPdfService,
    pdf_cache: Option<PdfCache>,
}

impl CaptureServices {
    /// Builds every service from `config`. Nothing touches the database or
    /// the network until first used.
    pub fn from_config(config: CaptureConfig) -> Result<Self, CaptureError> {
        let store = DurableStore::new(match &config.database_path {
            Some(path) => StoreLocation::File(path.clone()),
            None => StoreLocation::Memory,
        });
        let tokens = AuthTokens::new(Some(store.clone()));
        let transport = Arc::new(HttpTransport::new(
            config.api_base(),
            tokens.clone(),
            config.upload.request_timeout(),
        )?);
        let pdf_cache = config.pdf_cache_dir.clone().map(PdfCache::new);

        let executor = UploadExecutor::new(transport.clone(), &config.upload, BlobCache::new())
            .with_queue(store.clone(), Some(AUTH_TOKEN_KEY.to_string()));
        let clock = Arc::new(SystemClock);
        let recovery = RecoveryService::new(store.clone(), clock.clone(), &config.recovery);
        let resync = Arc::new(
            ResyncService::new(store.clone(), executor.clone(), config.queue.clone(), clock)
                .with_tokens(tokens.clone()),
        );
        let estimator = Arc::new(CapabilityEstimator::from_settings(&config.capability));
        let pdf = ProtocolPdfService::new(transport, pdf_cache.clone()).with_store(store.clone());

        Ok(Self {
            config,
            store,
            tokens,
            executor,
            estimator,
            recovery,
            resync,
            pdf,
            pdf_cache,
        })
    }

    /// Starts a transform worker and returns an orchestrator sharing this
    /// process' store, executor and capability cache
    pub async fn orchestrator(&self) -> Result<StreamOrchestrator, CaptureError> {
        let settings = &self.config.transform;
        let worker = TransformWorker::start(WorkerConfig {
            threads: settings.worker_threads.max(1),
            ready_timeout: Duration::from_secs(settings.ready_timeout_secs.max(1)),
            request_timeout: Duration::from_secs(settings.request_timeout_secs.max(1)),
            options: TransformOptions {
                max_input_bytes: settings.max_input_bytes,
                max_pixels: settings.max_pixels,
                ..TransformOptions::default()
            },
        })
        .await?;

        let mut orchestrator = StreamOrchestrator::new(self.store.clone(), worker, self.executor.clone())
            .with_estimator(self.estimator.clone());
        if let Some(cache) = &self.pdf_cache {
            orchestrator = orchestrator.with_pdf_cache(cache.clone());
        }
        Ok(orchestrator)
    }
}
