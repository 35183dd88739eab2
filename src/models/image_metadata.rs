use crate::models::UploadStatus;
use capture_imaging::GpsPoint;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Persisted per-image record. Metadata and URLs only, never image bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageMetadata {
    pub id: String,
    pub protocol_id: String,
    pub filename: String,
    pub media_type: String,
    pub upload_status: UploadStatus,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
    pub size: u64,
    /// sha256 hex of the uploaded gallery derivative
    pub checksum: Option<String>,
    /// Milliseconds since epoch
    pub created_at: i64,
}

impl ImageMetadata {
    pub fn new(
        id: impl Into<String>,
        protocol_id: impl Into<String>,
        filename: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            protocol_id: protocol_id.into(),
            filename: filename.into(),
            media_type: media_type.into(),
            upload_status: UploadStatus::Pending,
            url: None,
            pdf_url: None,
            size: 0,
            checksum: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub(crate) const IMAGE_COLUMNS: &str =
    "id, protocol_id, filename, media_type, upload_status, url, pdf_url, size_bytes, checksum, created_at";

impl<'r> TryFrom<&Row<'r>> for ImageMetadata {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        let status: String = row.get(4)?;
        let size: i64 = row.get(7)?;
        Ok(ImageMetadata {
            id: row.get(0)?,
            protocol_id: row.get(1)?,
            filename: row.get(2)?,
            media_type: row.get(3)?,
            upload_status: UploadStatus::from_str(&status),
            url: row.get(5)?,
            pdf_url: row.get(6)?,
            size: size.max(0) as u64,
            checksum: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

/// Result handed back to the UI for every confirmed image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolImage {
    pub id: String,
    pub url: String,
    pub pdf_url: Option<String>,
    pub media_type: String,
    pub filename: String,
    pub original_size: usize,
    pub compressed_size: usize,
    pub width: u32,
    pub height: u32,
    pub gps: Option<GpsPoint>,
    pub timestamp: i64,
}
