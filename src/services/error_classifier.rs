//! Maps pipeline errors to a category and the one recovery strategy that
//! goes with it.
//!
//! Typed signals (HTTP status, transport kind, error variant) are checked
//! first; only then does the message text get scanned for keywords.

use crate::database::StoreError;
use crate::error::CaptureError;
use crate::services::transport::UploadError;
use capture_imaging::{PdfError, TransformError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Server,
    Client,
    Memory,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Server => "server",
            ErrorCategory::Client => "client",
            ErrorCategory::Memory => "memory",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "network" => ErrorCategory::Network,
            "server" => ErrorCategory::Server,
            "client" => ErrorCategory::Client,
            "memory" => ErrorCategory::Memory,
            "timeout" => ErrorCategory::Timeout,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorCategory::Network | ErrorCategory::Server => RecoveryStrategy::QueueForBackgroundRetry,
            ErrorCategory::Timeout => RecoveryStrategy::RetryImmediately,
            ErrorCategory::Memory => RecoveryStrategy::ShrinkBatch,
            ErrorCategory::Client => RecoveryStrategy::SurfaceToUser,
            ErrorCategory::Unknown => RecoveryStrategy::AbortAndCheckpoint,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Server | ErrorCategory::Timeout | ErrorCategory::Memory
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Hand the unit to the durable queue for the resync sweep
    QueueForBackgroundRetry,
    /// Caller retries straight away under its retry policy
    RetryImmediately,
    /// Halve the next batch and drop buffers that are already uploaded
    ShrinkBatch,
    /// Never retried; show the message
    SurfaceToUser,
    /// Stop the unit and checkpoint the draft
    AbortAndCheckpoint,
}

/// What the pipeline was doing when the error happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Transform,
    Upload,
    Persist,
    Recovery,
    Pdf,
}

impl Operation {
    fn label(&self) -> &str {
        match self {
            Operation::Transform => "Processing the photo",
            Operation::Upload => "Uploading the photo",
            Operation::Persist => "Saving progress",
            Operation::Recovery => "Restoring the previous session",
            Operation::Pdf => "Creating the PDF",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub user_message: String,
    pub strategy: RecoveryStrategy,
}

impl Classification {
    fn new(category: ErrorCategory, operation: Operation) -> Self {
        Self {
            category,
            retryable: category.is_retryable(),
            user_message: user_message(category, operation),
            strategy: category.strategy(),
        }
    }
}

fn user_message(category: ErrorCategory, operation: Operation) -> String {
    let action = operation.label();
    match category {
        ErrorCategory::Network => format!("{} failed: no connection. It will be retried automatically.", action),
        ErrorCategory::Server => format!("{} failed: the server is busy. It will be retried automatically.", action),
        ErrorCategory::Timeout => format!("{} took too long. Trying again.", action),
        ErrorCategory::Memory => format!("{} ran out of memory. Continuing with smaller batches.", action),
        ErrorCategory::Client => format!("{} failed and cannot be retried. Please check the photo or sign in again.", action),
        ErrorCategory::Unknown => format!("{} failed unexpectedly. Your progress has been saved.", action),
    }
}

fn category_for_status(status: u16) -> ErrorCategory {
    match status {
        408 => ErrorCategory::Timeout,
        413 => ErrorCategory::Client,
        429 => ErrorCategory::Server,
        400..=499 => ErrorCategory::Client,
        500..=599 => ErrorCategory::Server,
        _ => ErrorCategory::Unknown,
    }
}

/// Keyword fallback over the error text; order matters
fn category_from_message(message: &str) -> ErrorCategory {
    let message = message.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| message.contains(w));

    if has(&["timeout", "timed out", "deadline"]) {
        ErrorCategory::Timeout
    } else if has(&["out of memory", "memory", "allocation", "quota exceeded"]) {
        ErrorCategory::Memory
    } else if has(&["network", "connection", "connect", "offline", "dns", "unreachable", "reset by peer"]) {
        ErrorCategory::Network
    } else if has(&["internal server", "service unavailable", "bad gateway", "server error"]) {
        ErrorCategory::Server
    } else if has(&["unauthorized", "forbidden", "token", "invalid", "too large", "not found", "bad request"]) {
        ErrorCategory::Client
    } else {
        ErrorCategory::Unknown
    }
}

/// Category for an upload failure on its own
pub fn categorize_upload(error: &UploadError) -> ErrorCategory {
    match error {
        UploadError::MissingToken => ErrorCategory::Client,
        UploadError::Http { status, .. } => category_for_status(*status),
        UploadError::Network(_) => ErrorCategory::Network,
        UploadError::Timeout => ErrorCategory::Timeout,
        UploadError::InvalidResponse(_) => ErrorCategory::Server,
        UploadError::SourceUnavailable(_) => ErrorCategory::Client,
        UploadError::IoError(e) => category_from_message(&e.to_string()),
        UploadError::Cancelled => ErrorCategory::Unknown,
    }
}

fn categorize_transform(error: &TransformError) -> ErrorCategory {
    match error {
        TransformError::Decode(_) | TransformError::InputTooLarge(_) | TransformError::EmptyOutput(_) => {
            ErrorCategory::Client
        }
        TransformError::MemoryLimit(_) => ErrorCategory::Memory,
        TransformError::Timeout => ErrorCategory::Timeout,
        other => category_from_message(&other.to_string()),
    }
}

/// Classifies `error` raised during `operation`
pub fn classify(error: &CaptureError, operation: Operation) -> Classification {
    let category = match error {
        CaptureError::Upload(e) => categorize_upload(e),
        CaptureError::Transform(e) => categorize_transform(e),
        CaptureError::Pdf(PdfError::Image(e)) => categorize_transform(e),
        CaptureError::Store(StoreError::PayloadRejected { .. }) => ErrorCategory::Client,
        CaptureError::Config(_) => ErrorCategory::Client,
        other => category_from_message(&other.to_string()),
    };
    log::debug!("Classified '{}' during {:?} as {}", error, operation, category.as_str());
    Classification::new(category, operation)
}

/// Classification of a per-image transform failure
pub fn classify_transform(error: &TransformError) -> Classification {
    Classification::new(categorize_transform(error), Operation::Transform)
}

/// Shorthand for upload failures
pub fn classify_upload(error: &UploadError) -> Classification {
    Classification::new(categorize_upload(error), Operation::Upload)
}
