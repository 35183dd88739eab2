use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// In-progress capture session for one protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolDraft {
    pub protocol_id: String,
    /// Snapshot of the form fields, as the UI hands it over
    pub form_data: serde_json::Value,
    pub image_ids: Vec<String>,
    pub uploaded_count: u32,
    pub total_count: u32,
    pub created_at: i64,
    pub last_modified: i64,
}

impl ProtocolDraft {
    pub fn new(protocol_id: impl Into<String>, total_count: u32) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            protocol_id: protocol_id.into(),
            form_data: serde_json::Value::Object(Default::default()),
            image_ids: Vec::new(),
            uploaded_count: 0,
            total_count,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        self.uploaded_count < self.total_count
    }

    /// Records confirmed images, keeping `uploaded_count <= total_count`
    pub fn record_uploaded(&mut self, image_ids: impl IntoIterator<Item = String>) {
        for id in image_ids {
            if !self.image_ids.contains(&id) {
                self.image_ids.push(id);
                self.uploaded_count = (self.uploaded_count + 1).min(self.total_count);
            }
        }
    }
}

pub(crate) const DRAFT_COLUMNS: &str =
    "protocol_id, form_data, image_ids, uploaded_count, total_count, created_at, last_modified";

impl<'r> TryFrom<&Row<'r>> for ProtocolDraft {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        let form_data: String = row.get(1)?;
        let image_ids: String = row.get(2)?;
        let uploaded: i64 = row.get(3)?;
        let total: i64 = row.get(4)?;
        Ok(ProtocolDraft {
            protocol_id: row.get(0)?,
            form_data: serde_json::from_str(&form_data).unwrap_or(serde_json::Value::Null),
            image_ids: serde_json::from_str(&image_ids).unwrap_or_default(),
            uploaded_count: uploaded.max(0) as u32,
            total_count: total.max(0) as u32,
            created_at: row.get(5)?,
            last_modified: row.get(6)?,
        })
    }
}
