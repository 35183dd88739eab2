use crate::models::BlobRef;
use crate::services::transport::{UploadError, UploadResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// In-process byte store behind `BlobRef::Memory` handles.
///
/// Entries live until released; nothing here survives a restart.
#[derive(Clone, Default)]
pub struct BlobCache {
    entries: Arc<Mutex<HashMap<String, Arc<Vec<u8>>>>>,
}

impl BlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` and returns a handle to them
    pub fn insert(&self, bytes: Vec<u8>) -> BlobRef {
        let key = uuid::Uuid::new_v4().to_string();
        if let Ok(mut guard) = self.entries.lock() {
            guard.insert(key.clone(), Arc::new(bytes));
        }
        BlobRef::Memory(key)
    }

    pub fn contains(&self, blob: &BlobRef) -> bool {
        match blob {
            BlobRef::Memory(key) => self
                .entries
                .lock()
                .map(|g| g.contains_key(key))
                .unwrap_or(false),
            BlobRef::File(path) => path.exists(),
        }
    }

    /// Total size of `blob` without loading it
    pub async fn size_of(&self, blob: &BlobRef) -> UploadResult<u64> {
        match blob {
            BlobRef::Memory(key) => self
                .entries
                .lock()
                .ok()
                .and_then(|g| g.get(key).map(|b| b.len() as u64))
                .ok_or_else(|| UploadError::SourceUnavailable(blob.to_ref_string())),
            BlobRef::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    /// Full contents of `blob`
    pub async fn resolve(&self, blob: &BlobRef) -> UploadResult<Arc<Vec<u8>>> {
        match blob {
            BlobRef::Memory(key) => self
                .entries
                .lock()
                .ok()
                .and_then(|g| g.get(key).cloned())
                .ok_or_else(|| UploadError::SourceUnavailable(blob.to_ref_string())),
            BlobRef::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    UploadError::SourceUnavailable(format!("{}: {}", path.display(), e))
                })?;
                Ok(Arc::new(bytes))
            }
        }
    }

    /// Reads `len` bytes at `offset`. Files are read in place so a chunk
    /// never requires the whole file in memory.
    pub async fn read_range(&self, blob: &BlobRef, offset: u64, len: usize) -> UploadResult<Vec<u8>> {
        match blob {
            BlobRef::Memory(_) => {
                let bytes = self.resolve(blob).await?;
                let start = (offset as usize).min(bytes.len());
                let end = start.saturating_add(len).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            BlobRef::File(path) => {
                use tokio::io::{AsyncReadExt, AsyncSeekExt};

                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut chunk = Vec::with_capacity(len);
                file.take(len as u64).read_to_end(&mut chunk).await?;
                Ok(chunk)
            }
        }
    }

    /// Drops a memory entry. File handles are left alone.
    pub fn release(&self, blob: &BlobRef) {
        if let BlobRef::Memory(key) = blob {
            if let Ok(mut guard) = self.entries.lock() {
                guard.remove(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Preview handles the UI holds per upload task
#[derive(Clone, Default)]
pub struct PreviewRegistry {
    handles: Arc<Mutex<HashSet<String>>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str) {
        if let Ok(mut guard) = self.handles.lock() {
            guard.insert(task_id.to_string());
        }
    }

    /// Returns whether a handle was actually outstanding
    pub fn release(&self, task_id: &str) -> bool {
        self.handles
            .lock()
            .map(|mut g| g.remove(task_id))
            .unwrap_or(false)
    }

    pub fn is_registered(&self, task_id: &str) -> bool {
        self.handles
            .lock()
            .map(|g| g.contains(task_id))
            .unwrap_or(false)
    }

    pub fn outstanding(&self) -> usize {
        self.handles.lock().map(|g| g.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip_and_release() {
        let cache = BlobCache::new();
        let blob = cache.insert(vec![1, 2, 3, 4, 5]);
        assert!(cache.contains(&blob));
        assert_eq!(cache.size_of(&blob).await.unwrap(), 5);
        assert_eq!(cache.read_range(&blob, 3, 10).await.unwrap(), vec![4, 5]);

        cache.release(&blob);
        assert!(cache.is_empty());
        assert!(matches!(
            cache.resolve(&blob).await,
            Err(UploadError::SourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_file_ranges_read_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        std::fs::write(&path, &data).unwrap();

        let cache = BlobCache::new();
        let blob = BlobRef::File(path);
        assert_eq!(cache.size_of(&blob).await.unwrap(), 10_000);
        let chunk = cache.read_range(&blob, 4096, 4096).await.unwrap();
        assert_eq!(chunk, data[4096..8192].to_vec());
        let tail = cache.read_range(&blob, 8192, 4096).await.unwrap();
        assert_eq!(tail.len(), 10_000 - 8192);
    }

    #[test]
    fn test_preview_registry() {
        let previews = PreviewRegistry::new();
        previews.register("a");
        previews.register("b");
        assert!(previews.release("a"));
        assert!(!previews.release("a"));
        assert_eq!(previews.outstanding(), 1);
    }
}
