use crate::models::{BlobRef, Destination, UploadTask, Variant};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Durable copy of an upload that should be retried later
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueTask {
    pub id: String,
    pub image_id: Option<String>,
    pub variant: Variant,
    /// Reference to the bytes, never the bytes
    pub blob_ref: BlobRef,
    pub filename: String,
    pub content_type: String,
    pub destination: Destination,
    /// Name of the token slot to authenticate with, not the token
    pub auth_context: Option<String>,
    pub retries: u32,
    pub last_error: Option<String>,
    pub last_attempt: Option<i64>,
    pub created_at: i64,
}

impl QueueTask {
    pub fn from_upload(task: &UploadTask, auth_context: Option<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            image_id: task.image_id.clone(),
            variant: task.variant,
            blob_ref: task.source.clone(),
            filename: task.filename.clone(),
            content_type: task.content_type.clone(),
            destination: task.destination.clone(),
            auth_context,
            retries: 0,
            last_error: task.error.clone(),
            last_attempt: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Rebuilds a single upload unit for the resync sweep
    pub fn to_upload_task(&self) -> UploadTask {
        let mut task = UploadTask::new(
            self.blob_ref.clone(),
            self.filename.clone(),
            self.content_type.clone(),
            self.destination.clone(),
        );
        task.id = self.id.clone();
        task.image_id = self.image_id.clone();
        task.variant = self.variant;
        task
    }
}

pub(crate) const QUEUE_COLUMNS: &str = "id, image_id, variant, blob_ref, filename, content_type, \
     record_type, protocol_id, protocol_type, media_type, auth_context, retries, last_error, \
     last_attempt, created_at";

impl<'r> TryFrom<&Row<'r>> for QueueTask {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        let variant: String = row.get(2)?;
        let blob_ref: String = row.get(3)?;
        let retries: i64 = row.get(11)?;
        let blob_ref = BlobRef::parse(&blob_ref).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("invalid blob reference {:?}", blob_ref).into(),
            )
        })?;
        Ok(QueueTask {
            id: row.get(0)?,
            image_id: row.get(1)?,
            variant: Variant::from_str(&variant),
            blob_ref,
            filename: row.get(4)?,
            content_type: row.get(5)?,
            destination: Destination {
                record_type: row.get(6)?,
                entity_id: row.get(7)?,
                protocol_type: row.get(8)?,
                media_type: row.get(9)?,
            },
            auth_context: row.get(10)?,
            retries: retries.max(0) as u32,
            last_error: row.get(12)?,
            last_attempt: row.get(13)?,
            created_at: row.get(14)?,
        })
    }
}
