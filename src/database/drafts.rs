use super::guard::{ensure_json_metadata, ensure_metadata};
use super::{now_ms, DurableStore, StoreResult};
use crate::models::protocol_draft::DRAFT_COLUMNS;
use crate::models::ProtocolDraft;
use rusqlite::{params, OptionalExtension};

impl DurableStore {
    /// Writes a draft and stamps `last_modified`.
    ///
    /// `uploaded_count` is clamped to `total_count`; `created_at` of an
    /// existing row is kept.
    pub async fn save_draft(&self, draft: &ProtocolDraft) -> StoreResult<ProtocolDraft> {
        ensure_metadata("drafts.protocol_id", &draft.protocol_id)?;
        ensure_json_metadata("drafts.form_data", &draft.form_data)?;
        for id in &draft.image_ids {
            ensure_metadata("drafts.image_ids", id)?;
        }

        let mut stored = draft.clone();
        if stored.uploaded_count > stored.total_count {
            log::warn!(
                "Draft {} reports {} of {} uploaded, clamping",
                stored.protocol_id,
                stored.uploaded_count,
                stored.total_count
            );
            stored.uploaded_count = stored.total_count;
        }
        stored.last_modified = now_ms();

        let form_data = serde_json::to_string(&stored.form_data)?;
        let image_ids = serde_json::to_string(&stored.image_ids)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO drafts (protocol_id, form_data, image_ids, uploaded_count, total_count, created_at, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(protocol_id) DO UPDATE SET
                    form_data = excluded.form_data,
                    image_ids = excluded.image_ids,
                    uploaded_count = excluded.uploaded_count,
                    total_count = excluded.total_count,
                    last_modified = excluded.last_modified",
                params![
                    stored.protocol_id,
                    form_data,
                    image_ids,
                    stored.uploaded_count,
                    stored.total_count,
                    stored.created_at,
                    stored.last_modified,
                ],
            )?;

            stored.created_at = conn.query_row(
                "SELECT created_at FROM drafts WHERE protocol_id = ?1",
                [&stored.protocol_id],
                |row| row.get(0),
            )?;
            Ok(stored)
        })
        .await
    }

    pub async fn get_draft(&self, protocol_id: &str) -> StoreResult<Option<ProtocolDraft>> {
        self.with_conn(|conn| {
            let draft = conn
                .query_row(
                    &format!("SELECT {} FROM drafts WHERE protocol_id = ?1", DRAFT_COLUMNS),
                    [protocol_id],
                    |row| ProtocolDraft::try_from(row),
                )
                .optional()?;
            Ok(draft)
        })
        .await
    }

    /// All drafts, most recently modified first
    pub async fn get_all_drafts(&self) -> StoreResult<Vec<ProtocolDraft>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM drafts ORDER BY last_modified DESC",
                DRAFT_COLUMNS
            ))?;
            let rows = stmt.query_map([], |row| ProtocolDraft::try_from(row))?;
            let drafts = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(drafts)
        })
        .await
    }

    pub async fn delete_draft(&self, protocol_id: &str) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM drafts WHERE protocol_id = ?1", [protocol_id])?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StoreError;

    #[tokio::test]
    async fn test_save_and_get_draft() {
        let store = DurableStore::in_memory();
        let mut draft = ProtocolDraft::new("p1", 4);
        draft.form_data = serde_json::json!({ "mileage": 12000, "fuel": "3/4" });
        draft.record_uploaded(vec!["i1".to_string()]);

        let saved = store.save_draft(&draft).await.unwrap();
        let loaded = store.get_draft("p1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.uploaded_count, 1);
        assert_eq!(loaded.form_data["mileage"], 12000);
    }

    #[tokio::test]
    async fn test_uploaded_count_is_clamped() {
        let store = DurableStore::in_memory();
        let mut draft = ProtocolDraft::new("p1", 2);
        draft.uploaded_count = 5;

        let saved = store.save_draft(&draft).await.unwrap();
        assert_eq!(saved.uploaded_count, 2);
        let loaded = store.get_draft("p1").await.unwrap().unwrap();
        assert!(loaded.uploaded_count <= loaded.total_count);
    }

    #[tokio::test]
    async fn test_resave_keeps_created_at() {
        let store = DurableStore::in_memory();
        let mut draft = ProtocolDraft::new("p1", 2);
        draft.created_at = 1_000;
        store.save_draft(&draft).await.unwrap();

        draft.created_at = 9_999;
        draft.uploaded_count = 1;
        let saved = store.save_draft(&draft).await.unwrap();
        assert_eq!(saved.created_at, 1_000);
        assert!(saved.last_modified >= 1_000);
    }

    #[tokio::test]
    async fn test_draft_with_embedded_photo_rejected() {
        let store = DurableStore::in_memory();
        let mut draft = ProtocolDraft::new("p1", 1);
        draft.form_data = serde_json::json!({ "signature": "data:image/png;base64,iVBORw0KGgo=" });

        let err = store.save_draft(&draft).await.unwrap_err();
        assert!(matches!(err, StoreError::PayloadRejected { .. }));
    }

    #[tokio::test]
    async fn test_get_all_and_delete_drafts() {
        let store = DurableStore::in_memory();
        store.save_draft(&ProtocolDraft::new("p1", 1)).await.unwrap();
        store.save_draft(&ProtocolDraft::new("p2", 1)).await.unwrap();
        assert_eq!(store.get_all_drafts().await.unwrap().len(), 2);

        assert!(store.delete_draft("p1").await.unwrap());
        let remaining = store.get_all_drafts().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].protocol_id, "p2");
    }
}
