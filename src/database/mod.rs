//! Local durable store
//!
//! SQLite-backed tables for image metadata, protocol drafts, the retry
//! queue and a small session key/value table. The connection is opened
//! lazily on first use; concurrent first callers share one initialisation.

pub mod drafts;
pub mod guard;
pub mod images;
pub mod queue;
pub mod schema;
pub mod session;

use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::{Mutex, OnceCell};

/// Errors from the durable store
#[derive(Debug)]
pub enum StoreError {
    /// Opening or migrating the database failed
    Init(String),
    Database(rusqlite::Error),
    /// A write carried something that looks like an image payload
    PayloadRejected { field: String, reason: String },
    NotFound(String),
    Serialization(serde_json::Error),
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Init(msg) => write!(f, "Store initialisation failed: {}", msg),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::PayloadRejected { field, reason } => {
                write!(f, "Refusing to persist payload in {}: {}", field, reason)
            }
            StoreError::NotFound(what) => write!(f, "Not found: {}", what),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Closed => write!(f, "Store has been closed"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Where the database lives
#[derive(Debug, Clone, PartialEq)]
pub enum StoreLocation {
    File(PathBuf),
    /// Private in-memory database, for tests and ephemeral sessions
    Memory,
}

/// Row counts plus an on-disk size estimate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub images: usize,
    pub drafts: usize,
    pub queue: usize,
    pub estimated_bytes: u64,
}

struct StoreInner {
    location: StoreLocation,
    conn: OnceCell<Mutex<Connection>>,
    init_runs: AtomicUsize,
    closed: AtomicBool,
}

/// Handle to the durable store. Clones share one connection.
#[derive(Clone)]
pub struct DurableStore {
    inner: Arc<StoreInner>,
}

impl DurableStore {
    /// Creates a handle; nothing is opened until the first operation
    pub fn new(location: StoreLocation) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                location,
                conn: OnceCell::new(),
                init_runs: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreLocation::Memory)
    }

    pub fn location(&self) -> &StoreLocation {
        &self.inner.location
    }

    /// Opens and migrates the database. Idempotent; safe to race.
    pub async fn init(&self) -> StoreResult<()> {
        self.with_conn(|_| Ok(())).await
    }

    /// Marks the store closed. Later operations fail with `StoreError::Closed`.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            log::info!("Durable store closed");
        }
    }

    fn open(location: &StoreLocation) -> StoreResult<Connection> {
        let conn = match location {
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            StoreError::Init(format!("cannot create {}: {}", parent.display(), e))
                        })?;
                    }
                }
                Connection::open(path).map_err(|e| StoreError::Init(e.to_string()))?
            }
            StoreLocation::Memory => {
                Connection::open_in_memory().map_err(|e| StoreError::Init(e.to_string()))?
            }
        };

        schema::init_schema(&conn).map_err(|e| StoreError::Init(e.to_string()))?;
        Ok(conn)
    }

    /// Runs `f` against the shared connection.
    ///
    /// SQLite calls block, so on a multi-threaded runtime they run under
    /// `block_in_place` and the worker's other tasks move to another thread.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        let cell = self
            .inner
            .conn
            .get_or_try_init(|| async {
                self.inner.init_runs.fetch_add(1, Ordering::SeqCst);
                log::debug!("Opening durable store at {:?}", self.inner.location);
                run_blocking(|| Self::open(&self.inner.location)).map(Mutex::new)
            })
            .await?;

        let mut conn = cell.lock().await;
        run_blocking(|| f(&mut *conn))
    }

    /// How many times initialisation actually ran
    pub fn init_runs(&self) -> usize {
        self.inner.init_runs.load(Ordering::SeqCst)
    }

    /// Removes every image, draft and queue row of one protocol in one transaction
    pub async fn clear_protocol_data(&self, protocol_id: &str) -> StoreResult<()> {
        let (images, drafts, queued) = self
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                let images = tx.execute("DELETE FROM images WHERE protocol_id = ?1", [protocol_id])?;
                let drafts = tx.execute("DELETE FROM drafts WHERE protocol_id = ?1", [protocol_id])?;
                let queued = tx.execute("DELETE FROM queue WHERE protocol_id = ?1", [protocol_id])?;
                tx.commit()?;
                Ok((images, drafts, queued))
            })
            .await?;

        log::info!(
            "Cleared protocol {}: {} images, {} drafts, {} queued tasks",
            protocol_id,
            images,
            drafts,
            queued
        );
        Ok(())
    }

    /// Empties all tables including the session table
    pub async fn clear_all(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for table in ["images", "drafts", "queue", "session"] {
                tx.execute(&format!("DELETE FROM {}", table), [])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        log::info!("Cleared all durable store data");
        Ok(())
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        self.with_conn(|conn| {
            let count = |table: &str| -> StoreResult<usize> {
                let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
                Ok(n.max(0) as usize)
            };

            let images = count("images")?;
            let drafts = count("drafts")?;
            let queue = count("queue")?;

            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

            Ok(StoreStats {
                images,
                drafts,
                queue,
                estimated_bytes: (page_count.max(0) * page_size.max(0)) as u64,
            })
        })
        .await
    }
}

/// Runs blocking work in place, handing the worker's queue to another
/// thread when the runtime allows it
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Milliseconds since epoch, the timestamp unit used in every table
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Destination, ImageMetadata, ProtocolDraft, QueueTask, UploadTask};
    use crate::models::BlobRef;

    pub(crate) fn queue_task(protocol_id: &str) -> QueueTask {
        let task = UploadTask::new(
            BlobRef::Memory(uuid::Uuid::new_v4().to_string()),
            "photo.webp",
            "image/webp",
            Destination::protocol(protocol_id, "vehicle"),
        );
        QueueTask::from_upload(&task, Some("auth.token".to_string()))
    }

    #[tokio::test]
    async fn test_lazy_init_runs_once_under_concurrency() {
        let store = DurableStore::in_memory();
        assert_eq!(store.init_runs(), 0);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.get_draft(&format!("p{}", i)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_none());
        }

        store.init().await.unwrap();
        assert_eq!(store.init_runs(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_store_work_does_not_stall_runtime_worker() {
        let store = DurableStore::in_memory();
        store.init().await.unwrap();

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let ticked = Arc::new(AtomicBool::new(false));
        let flag = ticked.clone();
        let ticker = tokio::spawn(async move {
            let _ = started_tx.send(());
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });
        started_rx.await.unwrap();

        let seen = ticked.clone();
        let held = tokio::spawn(async move {
            store
                .with_conn(move |_conn| {
                    std::thread::sleep(std::time::Duration::from_millis(400));
                    Ok(seen.load(Ordering::SeqCst))
                })
                .await
        });

        // The single worker is busy inside the SQLite call; the timer task
        // still has to make progress.
        assert!(held.await.unwrap().unwrap());
        ticker.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capture.db");

        let store = DurableStore::new(StoreLocation::File(path.clone()));
        store.save_draft(&ProtocolDraft::new("p1", 3)).await.unwrap();
        drop(store);

        let reopened = DurableStore::new(StoreLocation::File(path));
        let draft = reopened.get_draft("p1").await.unwrap().unwrap();
        assert_eq!(draft.total_count, 3);
    }

    #[tokio::test]
    async fn test_clear_protocol_data_only_touches_owner() {
        let store = DurableStore::in_memory();
        store.save_image(&ImageMetadata::new("i1", "p1", "a.webp", "vehicle")).await.unwrap();
        store.save_image(&ImageMetadata::new("i2", "p2", "b.webp", "vehicle")).await.unwrap();
        store.save_draft(&ProtocolDraft::new("p1", 1)).await.unwrap();
        store.add_to_queue(&queue_task("p1")).await.unwrap();
        store.add_to_queue(&queue_task("p2")).await.unwrap();

        store.clear_protocol_data("p1").await.unwrap();

        assert!(store.get_protocol_images("p1").await.unwrap().is_empty());
        assert!(store.get_draft("p1").await.unwrap().is_none());
        assert!(store.get_protocol_queued_tasks("p1").await.unwrap().is_empty());
        assert_eq!(store.get_protocol_images("p2").await.unwrap().len(), 1);
        assert_eq!(store.get_protocol_queued_tasks("p2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_clear_all() {
        let store = DurableStore::in_memory();
        store.save_image(&ImageMetadata::new("i1", "p1", "a.webp", "vehicle")).await.unwrap();
        store.save_draft(&ProtocolDraft::new("p1", 1)).await.unwrap();
        store.add_to_queue(&queue_task("p1")).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.images, stats.drafts, stats.queue), (1, 1, 1));
        assert!(stats.estimated_bytes > 0);

        store.clear_all().await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.images, stats.drafts, stats.queue), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = DurableStore::in_memory();
        store.init().await.unwrap();
        store.close();
        assert!(matches!(store.get_draft("p1").await, Err(StoreError::Closed)));
    }
}
