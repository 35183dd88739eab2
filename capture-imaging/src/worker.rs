//! Transform worker pool
//!
//! Decoding and encoding run on dedicated OS threads. Requests and results
//! travel over channels only; every request gets an id and a pending
//! completion handle in a correlation table, which a dispatcher task
//! resolves as results come back.

use crate::models::{BatchFailure, BatchOutcome, ProcessedImage, QualityTier, SourceImage, TransformOptions};
use crate::transform::{self, TransformError, TransformResult};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;

/// Configuration for the transform worker pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of OS threads doing transforms
    pub threads: usize,
    /// How long `start` waits for the first thread to report ready
    pub ready_timeout: Duration,
    /// Per-request timeout, counted from the moment a thread picks the job up
    pub request_timeout: Duration,
    pub options: TransformOptions,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            ready_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            options: TransformOptions::default(),
        }
    }
}

struct Job {
    id: u64,
    source: SourceImage,
    options: TransformOptions,
    started: oneshot::Sender<()>,
}

enum WorkerEvent {
    Ready { worker: usize },
    Finished { id: u64, result: TransformResult<ProcessedImage> },
}

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<TransformResult<ProcessedImage>>>>>;

struct WorkerInner {
    config: WorkerConfig,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    pending: PendingTable,
    next_id: AtomicU64,
    destroyed: AtomicBool,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to the worker pool. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct TransformWorker {
    inner: Arc<WorkerInner>,
}

impl TransformWorker {
    /// Spawns the worker threads and waits (bounded) for the ready handshake.
    /// Must be called from within a tokio runtime.
    pub async fn start(config: WorkerConfig) -> TransformResult<Self> {
        let threads = config.threads.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<WorkerEvent>();

        for worker in 0..threads {
            let rx = job_rx.clone();
            let events = event_tx.clone();
            std::thread::Builder::new()
                .name(format!("capture-transform-{}", worker))
                .spawn(move || worker_loop(worker, rx, events))?;
        }
        drop(event_tx);

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, mut ready_rx) = watch::channel(false);

        let table = pending.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    WorkerEvent::Ready { worker } => {
                        log::debug!("Transform worker {} ready", worker);
                        let _ = ready_tx.send(true);
                    }
                    WorkerEvent::Finished { id, result } => {
                        let waiter = match table.lock() {
                            Ok(mut guard) => guard.remove(&id),
                            Err(_) => None,
                        };
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(result);
                            }
                            None => log::debug!("Dropping late transform result {}", id),
                        }
                    }
                }
            }
            log::debug!("Transform dispatcher stopped");
        });

        match tokio::time::timeout(config.ready_timeout, ready_rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => log::info!("Transform worker pool ready ({} threads)", threads),
            _ => log::warn!(
                "Transform workers not ready after {:?}, proceeding anyway",
                config.ready_timeout
            ),
        }

        Ok(Self {
            inner: Arc::new(WorkerInner {
                config,
                jobs: Mutex::new(Some(job_tx)),
                pending,
                next_id: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a result
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().map(|g| g.len()).unwrap_or(0)
    }

    fn forget(&self, id: u64) {
        if let Ok(mut guard) = self.inner.pending.lock() {
            guard.remove(&id);
        }
    }

    /// Transforms one image using the configured tier
    pub async fn process_image(&self, source: SourceImage) -> TransformResult<ProcessedImage> {
        let quality = self.inner.config.options.quality;
        self.process_image_with(source, quality).await
    }

    /// Transforms one image at the given quality tier
    pub async fn process_image_with(
        &self,
        source: SourceImage,
        quality: QualityTier,
    ) -> TransformResult<ProcessedImage> {
        if self.is_destroyed() {
            return Err(TransformError::WorkerDestroyed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        let (started_tx, started_rx) = oneshot::channel();
        match self.inner.pending.lock() {
            Ok(mut guard) => {
                guard.insert(id, tx);
            }
            Err(_) => return Err(TransformError::WorkerCrashed("pending table poisoned".into())),
        }

        let job = Job {
            id,
            source,
            options: TransformOptions {
                quality,
                ..self.inner.config.options.clone()
            },
            started: started_tx,
        };

        let sent = match self.inner.jobs.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(sender) => sender.send(job).is_ok(),
                None => false,
            },
            Err(_) => false,
        };
        if !sent {
            self.forget(id);
            return Err(TransformError::WorkerDestroyed);
        }

        // Waiting for a free thread does not count against the timeout.
        // destroy() answers through `rx` while the job is still queued.
        tokio::select! {
            biased;
            answered = &mut rx => {
                return answered.unwrap_or(Err(TransformError::WorkerDestroyed));
            }
            _ = started_rx => {}
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: either destroy() drained the table or the thread died
            Ok(Err(_)) => Err(TransformError::WorkerDestroyed),
            Err(_) => {
                self.forget(id);
                Err(TransformError::Timeout)
            }
        }
    }

    /// Transforms `files` with at most `bound` in flight (clamped to 2..=4).
    ///
    /// One failing file never cancels its siblings; failures are collected
    /// next to the successes. `on_progress(done, total)` fires per file.
    pub async fn process_batch<F>(
        &self,
        files: Vec<SourceImage>,
        quality: QualityTier,
        bound: usize,
        mut on_progress: F,
    ) -> BatchOutcome
    where
        F: FnMut(usize, usize),
    {
        let total = files.len();
        let bound = bound.clamp(2, 4);
        let mut outcome = BatchOutcome::default();
        let mut join_set: JoinSet<(usize, String, TransformResult<ProcessedImage>)> = JoinSet::new();
        let mut done = 0;

        for (index, source) in files.into_iter().enumerate() {
            while join_set.len() >= bound {
                if let Some(joined) = join_set.join_next().await {
                    collect(joined, &mut outcome);
                    done += 1;
                    on_progress(done, total);
                }
            }

            let worker = self.clone();
            join_set.spawn(async move {
                let filename = source.filename.clone();
                let result = worker.process_image_with(source, quality).await;
                (index, filename, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            collect(joined, &mut outcome);
            done += 1;
            on_progress(done, total);
        }

        outcome.successes.sort_by_key(|(index, _)| *index);
        outcome.failures.sort_by_key(|f| f.index);

        if !outcome.failures.is_empty() {
            log::warn!(
                "Transform batch finished with {} of {} failures",
                outcome.failures.len(),
                total
            );
        }
        outcome
    }

    /// Stops the pool. Waiting and later requests fail with `WorkerDestroyed`.
    /// Safe to call more than once.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Destroying transform worker pool");

        // Dropping the sender ends the thread loops after their current job
        if let Ok(mut guard) = self.inner.jobs.lock() {
            guard.take();
        }

        let waiters: Vec<_> = match self.inner.pending.lock() {
            Ok(mut guard) => guard.drain().map(|(_, tx)| tx).collect(),
            Err(_) => Vec::new(),
        };
        for tx in waiters {
            let _ = tx.send(Err(TransformError::WorkerDestroyed));
        }

        if let Ok(mut guard) = self.inner.dispatcher.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn collect(
    joined: Result<(usize, String, TransformResult<ProcessedImage>), tokio::task::JoinError>,
    outcome: &mut BatchOutcome,
) {
    match joined {
        Ok((index, _, Ok(image))) => outcome.successes.push((index, image)),
        Ok((index, filename, Err(error))) => {
            log::warn!("Transform of {} failed: {}", filename, error);
            outcome.failures.push(BatchFailure {
                index,
                filename,
                error,
            });
        }
        Err(e) => {
            // The spawned future only awaits a channel, so this is a runtime shutdown or panic
            log::error!("Transform task join error: {}", e);
            outcome.failures.push(BatchFailure {
                index: usize::MAX,
                filename: String::new(),
                error: TransformError::WorkerCrashed(e.to_string()),
            });
        }
    }
}

fn worker_loop(
    worker: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    events: tokio::sync::mpsc::UnboundedSender<WorkerEvent>,
) {
    if events.send(WorkerEvent::Ready { worker }).is_err() {
        return;
    }

    loop {
        let job = match jobs.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => break,
        };
        let Ok(job) = job else {
            break;
        };
        let _ = job.started.send(());

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            transform::process_image(&job.source, &job.options)
        }))
        .unwrap_or_else(|_| {
            Err(TransformError::WorkerCrashed(format!(
                "panic while transforming {}",
                job.source.filename
            )))
        });

        if events.send(WorkerEvent::Finished { id: job.id, result }).is_err() {
            break;
        }
    }

    log::debug!("Transform thread {} exiting", worker);
}

/// Internal batch bound: 2 on memory-constrained devices, otherwise up to 4
pub fn batch_concurrency(memory_constrained: bool, threads: usize) -> usize {
    if memory_constrained {
        2
    } else {
        threads.clamp(2, 4)
    }
}
