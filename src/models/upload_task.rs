use crate::models::BlobRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "uploading" => UploadStatus::Uploading,
            "completed" => UploadStatus::Completed,
            "failed" => UploadStatus::Failed,
            _ => UploadStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

/// Which derivative of an image a task carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Gallery,
    Pdf,
}

impl Variant {
    pub fn as_str(&self) -> &str {
        match self {
            Variant::Gallery => "gallery",
            Variant::Pdf => "pdf",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pdf" => Variant::Pdf,
            _ => Variant::Gallery,
        }
    }
}

/// Where an upload goes on the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    /// Record kind on the server, e.g. "protocol"
    pub record_type: String,
    /// Owning record (protocol) id
    pub entity_id: String,
    /// e.g. "handover" or "return"
    pub protocol_type: String,
    /// e.g. "vehicle", "document", "damage"
    pub media_type: String,
}

impl Destination {
    pub fn protocol(entity_id: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            record_type: "protocol".to_string(),
            entity_id: entity_id.into(),
            protocol_type: "handover".to_string(),
            media_type: media_type.into(),
        }
    }
}

/// One unit of upload work inside a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadTask {
    pub id: String,
    /// Image row this task belongs to, if any
    pub image_id: Option<String>,
    pub variant: Variant,
    pub source: BlobRef,
    pub filename: String,
    pub content_type: String,
    pub destination: Destination,
    pub status: UploadStatus,
    /// 0-100, never decreases while uploading
    pub progress: u8,
    pub url: Option<String>,
    pub error: Option<String>,
    /// Category of the final failure, as classified by the executor
    #[serde(default)]
    pub error_category: Option<String>,
    /// Failed attempts that were followed by another attempt
    pub retries: u32,
    /// Set when the task was handed to the durable retry queue
    pub queued: bool,
}

impl UploadTask {
    pub fn new(
        source: BlobRef,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        destination: Destination,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            image_id: None,
            variant: Variant::Gallery,
            source,
            filename: filename.into(),
            content_type: content_type.into(),
            destination,
            status: UploadStatus::Pending,
            progress: 0,
            url: None,
            error: None,
            error_category: None,
            retries: 0,
            queued: false,
        }
    }

    pub fn for_image(mut self, image_id: impl Into<String>, variant: Variant) -> Self {
        self.image_id = Some(image_id.into());
        self.variant = variant;
        self
    }

    /// Raises progress; lower values are ignored
    pub fn advance_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    pub fn mark_uploading(&mut self) {
        self.status = UploadStatus::Uploading;
    }

    pub fn mark_completed(&mut self, url: String) {
        self.status = UploadStatus::Completed;
        self.progress = 100;
        self.url = Some(url);
        self.error = None;
        self.error_category = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = UploadStatus::Failed;
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> UploadTask {
        UploadTask::new(
            BlobRef::Memory("k".into()),
            "a.webp",
            "image/webp",
            Destination::protocol("p1", "vehicle"),
        )
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut task = task();
        task.mark_uploading();
        task.advance_progress(40);
        task.advance_progress(10);
        assert_eq!(task.progress, 40);
        task.advance_progress(250);
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn test_completion_sets_url_and_full_progress() {
        let mut task = task();
        task.mark_failed("first try");
        task.mark_completed("https://cdn/x.webp".into());
        assert_eq!(task.status, UploadStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_status_conversion() {
        assert_eq!(UploadStatus::from_str("uploading"), UploadStatus::Uploading);
        assert_eq!(UploadStatus::from_str("bogus"), UploadStatus::Pending);
        assert!(UploadStatus::Failed.is_terminal());
        assert!(!UploadStatus::Uploading.is_terminal());
    }
}
