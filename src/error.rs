use crate::database::StoreError;
use crate::services::transport::UploadError;
use capture_imaging::{PdfError, TransformError};
use std::fmt;

/// Central error type of the capture core
#[derive(Debug)]
pub enum CaptureError {
    /// Durable store failure (including initialisation)
    Store(StoreError),
    /// Network or server side of an upload
    Upload(UploadError),
    /// Decode/encode of a single image, or the worker pool
    Transform(TransformError),
    Pdf(PdfError),
    /// Invalid or unreadable configuration
    Config(String),
    Filesystem(std::io::Error),
    /// The run was cancelled by the caller
    Cancelled,
    Other(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CaptureError::Store(e) => write!(f, "Store error: {}", e),
            CaptureError::Upload(e) => write!(f, "Upload error: {}", e),
            CaptureError::Transform(e) => write!(f, "Transform error: {}", e),
            CaptureError::Pdf(e) => write!(f, "PDF error: {}", e),
            CaptureError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CaptureError::Filesystem(e) => write!(f, "Filesystem error: {}", e),
            CaptureError::Cancelled => write!(f, "Operation cancelled"),
            CaptureError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<StoreError> for CaptureError {
    fn from(e: StoreError) -> Self {
        CaptureError::Store(e)
    }
}

impl From<UploadError> for CaptureError {
    fn from(e: UploadError) -> Self {
        CaptureError::Upload(e)
    }
}

impl From<TransformError> for CaptureError {
    fn from(e: TransformError) -> Self {
        CaptureError::Transform(e)
    }
}

impl From<PdfError> for CaptureError {
    fn from(e: PdfError) -> Self {
        CaptureError::Pdf(e)
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Filesystem(e)
    }
}

impl From<rusqlite::Error> for CaptureError {
    fn from(e: rusqlite::Error) -> Self {
        CaptureError::Store(StoreError::Database(e))
    }
}

/// User-friendly error messages for the UI
impl CaptureError {
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::Store(StoreError::Init(_)) => {
                "Local storage is not available. Photos cannot be saved on this device.".to_string()
            }
            CaptureError::Store(_) => "Saving upload progress failed. Please try again.".to_string(),
            CaptureError::Upload(UploadError::MissingToken) => {
                "You are not signed in. Please sign in again to upload photos.".to_string()
            }
            CaptureError::Upload(_) => {
                "Upload failed. It will be retried when the connection is back.".to_string()
            }
            CaptureError::Transform(_) => "A photo could not be processed.".to_string(),
            CaptureError::Pdf(_) => "The protocol PDF could not be created.".to_string(),
            CaptureError::Config(msg) => format!("Invalid configuration: {}", msg),
            CaptureError::Filesystem(_) => {
                "Error accessing files. Please check app permissions.".to_string()
            }
            CaptureError::Cancelled => "Upload cancelled.".to_string(),
            CaptureError::Other(msg) => msg.clone(),
        }
    }
}
