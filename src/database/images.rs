use super::guard::{ensure_metadata, ensure_metadata_opt};
use super::{DurableStore, StoreError, StoreResult};
use crate::models::image_metadata::IMAGE_COLUMNS;
use crate::models::{ImageMetadata, UploadStatus};
use rusqlite::{params, OptionalExtension};

fn check_image(image: &ImageMetadata) -> StoreResult<()> {
    ensure_metadata("images.id", &image.id)?;
    ensure_metadata("images.protocol_id", &image.protocol_id)?;
    ensure_metadata("images.filename", &image.filename)?;
    ensure_metadata("images.media_type", &image.media_type)?;
    ensure_metadata_opt("images.url", image.url.as_deref())?;
    ensure_metadata_opt("images.pdf_url", image.pdf_url.as_deref())?;
    ensure_metadata_opt("images.checksum", image.checksum.as_deref())
}

impl DurableStore {
    /// Inserts or replaces an image row
    pub async fn save_image(&self, image: &ImageMetadata) -> StoreResult<()> {
        check_image(image)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO images (id, protocol_id, filename, media_type, upload_status, url, pdf_url, size_bytes, checksum, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    protocol_id = excluded.protocol_id,
                    filename = excluded.filename,
                    media_type = excluded.media_type,
                    upload_status = excluded.upload_status,
                    url = excluded.url,
                    pdf_url = excluded.pdf_url,
                    size_bytes = excluded.size_bytes,
                    checksum = excluded.checksum",
                params![
                    image.id,
                    image.protocol_id,
                    image.filename,
                    image.media_type,
                    image.upload_status.as_str(),
                    image.url,
                    image.pdf_url,
                    image.size as i64,
                    image.checksum,
                    image.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_image(&self, id: &str) -> StoreResult<Option<ImageMetadata>> {
        self.with_conn(|conn| {
            let image = conn
                .query_row(
                    &format!("SELECT {} FROM images WHERE id = ?1", IMAGE_COLUMNS),
                    [id],
                    |row| ImageMetadata::try_from(row),
                )
                .optional()?;
            Ok(image)
        })
        .await
    }

    /// All images of one protocol, oldest first
    pub async fn get_protocol_images(&self, protocol_id: &str) -> StoreResult<Vec<ImageMetadata>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM images WHERE protocol_id = ?1 ORDER BY created_at, id",
                IMAGE_COLUMNS
            ))?;
            let rows = stmt.query_map([protocol_id], |row| ImageMetadata::try_from(row))?;
            let images = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(images)
        })
        .await
    }

    pub async fn get_images_by_status(&self, status: UploadStatus) -> StoreResult<Vec<ImageMetadata>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM images WHERE upload_status = ?1 ORDER BY created_at, id",
                IMAGE_COLUMNS
            ))?;
            let rows = stmt.query_map([status.as_str()], |row| ImageMetadata::try_from(row))?;
            let images = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(images)
        })
        .await
    }

    /// Updates status and, when given, the URL of an image
    pub async fn update_image_status(
        &self,
        id: &str,
        status: UploadStatus,
        url: Option<&str>,
    ) -> StoreResult<()> {
        ensure_metadata_opt("images.url", url)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE images SET upload_status = ?1, url = COALESCE(?2, url) WHERE id = ?3",
                params![status.as_str(), url, id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("image {}", id)));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_image_pdf_url(&self, id: &str, pdf_url: &str) -> StoreResult<()> {
        ensure_metadata("images.pdf_url", pdf_url)?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE images SET pdf_url = ?1 WHERE id = ?2",
                params![pdf_url, id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_image(&self, id: &str) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM images WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
        .await
    }

    /// Marks every `uploading` row failed, for one protocol or for all.
    /// Returns the number of rows changed.
    pub async fn mark_in_flight_failed(&self, protocol_id: Option<&str>) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let changed = match protocol_id {
                Some(owner) => conn.execute(
                    "UPDATE images SET upload_status = 'failed' WHERE upload_status = 'uploading' AND protocol_id = ?1",
                    [owner],
                )?,
                None => conn.execute(
                    "UPDATE images SET upload_status = 'failed' WHERE upload_status = 'uploading'",
                    [],
                )?,
            };
            if changed > 0 {
                log::warn!("Marked {} in-flight images as failed", changed);
            }
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_get_image() {
        let store = DurableStore::in_memory();
        let mut image = ImageMetadata::new("i1", "p1", "front.webp", "vehicle");
        image.size = 1234;
        store.save_image(&image).await.unwrap();

        let loaded = store.get_image("i1").await.unwrap().unwrap();
        assert_eq!(loaded, image);
        assert!(store.get_image("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_keeps_url_when_absent() {
        let store = DurableStore::in_memory();
        store
            .save_image(&ImageMetadata::new("i1", "p1", "front.webp", "vehicle"))
            .await
            .unwrap();

        store
            .update_image_status("i1", UploadStatus::Completed, Some("https://cdn/i1.webp"))
            .await
            .unwrap();
        store
            .update_image_status("i1", UploadStatus::Completed, None)
            .await
            .unwrap();

        let loaded = store.get_image("i1").await.unwrap().unwrap();
        assert_eq!(loaded.upload_status, UploadStatus::Completed);
        assert_eq!(loaded.url.as_deref(), Some("https://cdn/i1.webp"));

        let err = store
            .update_image_status("nope", UploadStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_data_uri_never_written() {
        let store = DurableStore::in_memory();
        let mut image = ImageMetadata::new("i1", "p1", "front.webp", "vehicle");
        image.url = Some("data:image/webp;base64,UklGRg==".to_string());

        let err = store.save_image(&image).await.unwrap_err();
        assert!(matches!(err, StoreError::PayloadRejected { .. }));
        assert!(store.get_image("i1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_in_flight_failed_scoped_to_owner() {
        let store = DurableStore::in_memory();
        for (id, owner) in [("a", "p1"), ("b", "p1"), ("c", "p2")] {
            let mut image = ImageMetadata::new(id, owner, "x.webp", "vehicle");
            image.upload_status = UploadStatus::Uploading;
            store.save_image(&image).await.unwrap();
        }

        assert_eq!(store.mark_in_flight_failed(Some("p1")).await.unwrap(), 2);
        assert_eq!(store.get_images_by_status(UploadStatus::Uploading).await.unwrap().len(), 1);
        assert_eq!(store.mark_in_flight_failed(None).await.unwrap(), 1);
        assert!(store.get_images_by_status(UploadStatus::Uploading).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_images_and_delete() {
        let store = DurableStore::in_memory();
        let mut first = ImageMetadata::new("i1", "p1", "a.webp", "vehicle");
        first.created_at = 1;
        let mut second = ImageMetadata::new("i2", "p1", "b.webp", "damage");
        second.created_at = 2;
        store.save_image(&second).await.unwrap();
        store.save_image(&first).await.unwrap();

        let images = store.get_protocol_images("p1").await.unwrap();
        assert_eq!(images.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["i1", "i2"]);

        assert!(store.delete_image("i1").await.unwrap());
        assert!(!store.delete_image("i1").await.unwrap());
        assert_eq!(store.get_protocol_images("p1").await.unwrap().len(), 1);
    }
}
