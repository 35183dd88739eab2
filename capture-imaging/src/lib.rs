//! # Capture Imaging
//!
//! CPU-bound image work for the protocol capture pipeline:
//! - Two derivatives per photo (gallery WebP, PDF JPEG) sized by quality tier
//! - A worker thread pool with request/response correlation and fail-fast destroy
//! - A small canvas benchmark used to score device performance
//! - Protocol PDF layout and rendering (feature `pdf`)
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use capture_imaging::{QualityTier, SourceImage, TransformWorker, WorkerConfig};
//!
//! let worker = TransformWorker::start(WorkerConfig::default()).await?;
//! let processed = worker
//!     .process_image_with(SourceImage::new("front.jpg", bytes), QualityTier::Mobile)
//!     .await?;
//! worker.destroy();
//! ```

pub mod benchmark;
pub mod models;
pub mod transform;
pub mod worker;

#[cfg(feature = "pdf")]
pub mod pdf;

pub use models::{
    BatchFailure, BatchOutcome, GalleryDerivative, GpsPoint, ImageInfo, PdfDerivative,
    ProcessedImage, QualityTier, SourceImage, TransformOptions,
};
pub use transform::{TransformError, TransformResult};
pub use worker::{batch_concurrency, TransformWorker, WorkerConfig};

#[cfg(feature = "pdf")]
pub use pdf::{PdfError, PdfImage, PdfLayout, PdfSection, ProtocolDocument};
