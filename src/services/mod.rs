pub mod auth;
pub mod blob_cache;
pub mod capability_service;
pub mod error_classifier;
pub mod pdf_service;
pub mod queue_service;
pub mod recovery_service;
pub mod retry_policy;
pub mod stream_service;
pub mod transport;
pub mod upload_service;

pub use auth::AuthTokens;
pub use blob_cache::{BlobCache, PreviewRegistry};
pub use capability_service::CapabilityEstimator;
pub use error_classifier::{Classification, ErrorCategory, RecoveryStrategy};
pub use pdf_service::{PdfCache, PdfStats, ProtocolPdfService};
pub use queue_service::ResyncService;
pub use recovery_service::{CrashReport, RecoveryService};
pub use stream_service::{StreamCallbacks, StreamOptions, StreamOrchestrator, StreamResult};
pub use transport::{HttpTransport, UploadError};
pub use upload_service::{UploadExecutor, UploadObserver};
