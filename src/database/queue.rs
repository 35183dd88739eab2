use super::guard::{ensure_metadata, ensure_metadata_opt};
use super::{now_ms, DurableStore, StoreError, StoreResult};
use crate::models::queue_task::QUEUE_COLUMNS;
use crate::models::QueueTask;
use rusqlite::params;

fn check_task(task: &QueueTask) -> StoreResult<()> {
    ensure_metadata("queue.id", &task.id)?;
    ensure_metadata_opt("queue.image_id", task.image_id.as_deref())?;
    ensure_metadata("queue.blob_ref", &task.blob_ref.to_ref_string())?;
    ensure_metadata("queue.filename", &task.filename)?;
    ensure_metadata("queue.content_type", &task.content_type)?;
    ensure_metadata("queue.record_type", &task.destination.record_type)?;
    ensure_metadata("queue.protocol_id", &task.destination.entity_id)?;
    ensure_metadata("queue.protocol_type", &task.destination.protocol_type)?;
    ensure_metadata("queue.media_type", &task.destination.media_type)?;
    ensure_metadata_opt("queue.auth_context", task.auth_context.as_deref())?;
    ensure_metadata_opt("queue.last_error", task.last_error.as_deref())
}

impl DurableStore {
    /// Adds a task with a fresh timestamp and zero retries
    pub async fn add_to_queue(&self, task: &QueueTask) -> StoreResult<QueueTask> {
        check_task(task)?;

        let mut stored = task.clone();
        stored.retries = 0;
        stored.created_at = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO queue ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    QUEUE_COLUMNS
                ),
                params![
                    stored.id,
                    stored.image_id,
                    stored.variant.as_str(),
                    stored.blob_ref.to_ref_string(),
                    stored.filename,
                    stored.content_type,
                    stored.destination.record_type,
                    stored.destination.entity_id,
                    stored.destination.protocol_type,
                    stored.destination.media_type,
                    stored.auth_context,
                    stored.retries,
                    stored.last_error,
                    stored.last_attempt,
                    stored.created_at,
                ],
            )?;

            log::info!(
                "Queued {} for background retry ({})",
                stored.filename,
                stored.last_error.as_deref().unwrap_or("no error recorded")
            );
            Ok(stored)
        })
        .await
    }

    /// All queued tasks, oldest first
    pub async fn get_queued_tasks(&self) -> StoreResult<Vec<QueueTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM queue ORDER BY created_at, id",
                QUEUE_COLUMNS
            ))?;
            let rows = stmt.query_map([], |row| QueueTask::try_from(row))?;
            let tasks = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    pub async fn get_protocol_queued_tasks(&self, protocol_id: &str) -> StoreResult<Vec<QueueTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM queue WHERE protocol_id = ?1 ORDER BY created_at, id",
                QUEUE_COLUMNS
            ))?;
            let rows = stmt.query_map([protocol_id], |row| QueueTask::try_from(row))?;
            let tasks = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
        .await
    }

    /// Increments the retry count and records the error and attempt time.
    /// Returns the new retry count. Removing exhausted tasks is up to the caller.
    pub async fn update_queue_task_error(&self, id: &str, error: &str) -> StoreResult<u32> {
        ensure_metadata("queue.last_error", error)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE queue SET retries = retries + 1, last_error = ?1, last_attempt = ?2 WHERE id = ?3",
                params![error, now_ms(), id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("queue task {}", id)));
            }

            let retries: i64 = conn.query_row("SELECT retries FROM queue WHERE id = ?1", [id], |row| {
                row.get(0)
            })?;
            Ok(retries.max(0) as u32)
        })
        .await
    }

    pub async fn remove_from_queue(&self, id: &str) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM queue WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::queue_task;
    use crate::models::BlobRef;

    #[tokio::test]
    async fn test_add_resets_retries_and_stamps_time() {
        let store = DurableStore::in_memory();
        let mut task = queue_task("p1");
        task.retries = 4;
        task.created_at = 0;

        let stored = store.add_to_queue(&task).await.unwrap();
        assert_eq!(stored.retries, 0);
        assert!(stored.created_at > 0);

        let tasks = store.get_queued_tasks().await.unwrap();
        assert_eq!(tasks, vec![stored]);
    }

    #[tokio::test]
    async fn test_update_error_increments_retries() {
        let store = DurableStore::in_memory();
        let stored = store.add_to_queue(&queue_task("p1")).await.unwrap();

        assert_eq!(store.update_queue_task_error(&stored.id, "HTTP 503").await.unwrap(), 1);
        assert_eq!(store.update_queue_task_error(&stored.id, "HTTP 502").await.unwrap(), 2);

        let task = &store.get_queued_tasks().await.unwrap()[0];
        assert_eq!(task.retries, 2);
        assert_eq!(task.last_error.as_deref(), Some("HTTP 502"));
        assert!(task.last_attempt.is_some());
    }

    #[tokio::test]
    async fn test_update_error_on_missing_task() {
        let store = DurableStore::in_memory();
        let err = store.update_queue_task_error("missing", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_queue_keeps_reference_not_bytes() {
        let store = DurableStore::in_memory();
        let stored = store.add_to_queue(&queue_task("p1")).await.unwrap();
        assert!(matches!(stored.blob_ref, BlobRef::Memory(_)));

        let mut bad = queue_task("p1");
        bad.filename = "data:image/jpeg;base64,/9j/4AAQSkZJRg==".to_string();
        assert!(matches!(
            store.add_to_queue(&bad).await,
            Err(StoreError::PayloadRejected { .. })
        ));
        assert_eq!(store.get_queued_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_protocol_filter() {
        let store = DurableStore::in_memory();
        let a = store.add_to_queue(&queue_task("p1")).await.unwrap();
        store.add_to_queue(&queue_task("p2")).await.unwrap();

        assert_eq!(store.get_protocol_queued_tasks("p1").await.unwrap().len(), 1);
        assert!(store.remove_from_queue(&a.id).await.unwrap());
        assert!(!store.remove_from_queue(&a.id).await.unwrap());
        assert!(store.get_protocol_queued_tasks("p1").await.unwrap().is_empty());
    }
}
