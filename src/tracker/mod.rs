//! Buffered, asynchronous step logging.
//!
//! [`StepTracker`] accepts step records from the agent loop without blocking
//! it, and a background worker batches them to the [`TaskStore`], uploading
//! screenshots to the [`BlobStore`] along the way. Store failures never fail
//! the task: affected records land in an on-disk spill file and are retried
//! with bounded exponential backoff.

mod record;
mod script;
mod spill;

pub use record::{screenshot_key, StepOutcome, StepRecord, StepType};
pub use script::{ScriptFile, ScriptMetadata, ScriptRecorder, ScriptStep};
pub use spill::SpillFile;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::storage::{BlobStore, TaskStore};

/// Tuning knobs for the tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Buffered step capacity; the oldest unflushed step is dropped when the
    /// buffer is full.
    pub capacity: usize,
    /// Idle flush period of the background worker.
    pub flush_interval: Duration,
    /// Spill file location for records that failed to persist.
    pub spill_path: PathBuf,
    /// Grace period for the final flush in [`StepTracker::close`].
    pub close_grace: Duration,
    /// Initial spill retry backoff; doubles up to `retry_max`.
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl TrackerConfig {
    pub fn for_task(task_id: Uuid) -> Self {
        Self {
            capacity: 64,
            flush_interval: Duration::from_secs(5),
            spill_path: std::env::temp_dir()
                .join("droidpilot")
                .join(format!("{}.spill", task_id)),
            close_grace: Duration::from_secs(5),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
        }
    }
}

/// Screenshot bytes pending upload, keyed for the blob store.
#[derive(Debug, Clone)]
pub struct ScreenshotBlob {
    pub key: String,
    pub bytes: Vec<u8>,
}

/// A step queued for persistence.
#[derive(Debug, Clone)]
pub struct TrackedStep {
    pub record: StepRecord,
    pub screenshot: Option<ScreenshotBlob>,
}

impl TrackedStep {
    pub fn bare(record: StepRecord) -> Self {
        Self {
            record,
            screenshot: None,
        }
    }
}

/// Invoked once per dropped step when the buffer overflows.
pub type OverflowHook = Arc<dyn Fn(u64) + Send + Sync>;

enum Command {
    Flush(oneshot::Sender<usize>),
    Close(oneshot::Sender<usize>),
}

struct Shared {
    task_id: Uuid,
    buffer: Mutex<VecDeque<TrackedStep>>,
    capacity: usize,
    watermark: usize,
    notify: Notify,
    spill: SpillFile,
    store: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    overflow_hook: Option<OverflowHook>,
    store_errors: AtomicU64,
    dropped: AtomicU64,
}

/// Append-only step log with a background flusher.
pub struct StepTracker {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StepTracker {
    pub fn new(
        task_id: Uuid,
        store: Arc<dyn TaskStore>,
        blobs: Arc<dyn BlobStore>,
        config: TrackerConfig,
        overflow_hook: Option<OverflowHook>,
    ) -> std::io::Result<Self> {
        let spill = SpillFile::open(&config.spill_path)?;
        let shared = Arc::new(Shared {
            task_id,
            buffer: Mutex::new(VecDeque::with_capacity(config.capacity)),
            capacity: config.capacity.max(1),
            watermark: config.capacity.div_ceil(2).max(1),
            notify: Notify::new(),
            spill,
            store,
            blobs,
            overflow_hook,
            store_errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker_loop(shared.clone(), cmd_rx, config.clone()));

        let tracker = Self {
            shared,
            cmd_tx,
            worker: Mutex::new(Some(worker)),
        };
        // records left over from a previous run surface on the first wakeup
        if !tracker.shared.spill.is_empty() {
            tracker.shared.notify.notify_one();
        }
        Ok(tracker)
    }

    /// Queue a step. Never blocks: when the buffer is full the oldest
    /// unflushed step is dropped (reported through the overflow hook) and the
    /// newest is always retained.
    pub fn append(&self, step: TrackedStep) {
        let mut overflowed = false;
        let len = {
            let mut buffer = self.shared.buffer.lock();
            if buffer.len() >= self.shared.capacity {
                buffer.pop_front();
                overflowed = true;
            }
            buffer.push_back(step);
            buffer.len()
        };

        if overflowed {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = &self.shared.overflow_hook {
                hook(1);
            }
        }
        if len >= self.shared.watermark {
            self.shared.notify.notify_one();
        }
    }

    /// Flush all currently-buffered steps. Returns the number written, or the
    /// count persisted before the deadline elapsed.
    pub async fn flush(&self, deadline: Option<Duration>) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Flush(tx)).is_err() {
            return 0;
        }
        match deadline {
            Some(limit) => tokio::time::timeout(limit, rx).await.ok().and_then(|r| r.ok()).unwrap_or(0),
            None => rx.await.unwrap_or(0),
        }
    }

    /// Flush with the configured grace period and join the worker.
    pub async fn close(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        let flushed = if self.cmd_tx.send(Command::Close(tx)).is_ok() {
            rx.await.unwrap_or(0)
        } else {
            0
        };
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        flushed
    }

    /// Steps dropped to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Persistence errors observed so far (store or blob).
    pub fn store_errors(&self) -> u64 {
        self.shared.store_errors.load(Ordering::Relaxed)
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    config: TrackerConfig,
) {
    let mut backoff = config.retry_base;
    let mut next_retry = Instant::now();

    loop {
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(config.flush_interval) => {}
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Flush(ack)) => {
                        let flushed = drain(&shared).await;
                        try_spill_recovery(&shared, &mut backoff, &mut next_retry, &config).await;
                        let _ = ack.send(flushed);
                        continue;
                    }
                    Some(Command::Close(ack)) => {
                        let flushed = tokio::time::timeout(config.close_grace, drain(&shared))
                            .await
                            .unwrap_or(0);
                        let _ = tokio::time::timeout(
                            config.close_grace,
                            try_spill_recovery(&shared, &mut backoff, &mut next_retry, &config),
                        )
                        .await;
                        let _ = ack.send(flushed);
                        return;
                    }
                    None => {
                        drain(&shared).await;
                        return;
                    }
                }
            }
        }

        drain(&shared).await;
        try_spill_recovery(&shared, &mut backoff, &mut next_retry, &config).await;
    }
}

/// Drain the buffer: upload screenshots, then batch-append to the store.
/// Returns the number of records handed to the store (or spilled).
async fn drain(shared: &Arc<Shared>) -> usize {
    let batch: Vec<TrackedStep> = {
        let mut buffer = shared.buffer.lock();
        buffer.drain(..).collect()
    };
    if batch.is_empty() {
        return 0;
    }

    let mut records = Vec::with_capacity(batch.len());
    for step in batch {
        let mut record = step.record;
        if let Some(shot) = step.screenshot {
            match shared
                .blobs
                .put(&shot.key, shot.bytes, "image/png")
                .await
            {
                Ok(url) => record.screenshot_ref = Some(url),
                Err(e) => {
                    shared.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %shot.key, error = %e, "screenshot upload failed, keeping blob key as reference");
                }
            }
        }
        records.push(record);
    }

    let count = records.len();
    if let Err(e) = shared.store.append_steps(shared.task_id, &records).await {
        shared.store_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(task = %shared.task_id, error = %e, "step persistence failed, spilling {} records", count);
        if let Err(io) = shared.spill.append(&records) {
            tracing::error!(task = %shared.task_id, error = %io, "spill write failed, records lost");
        }
    }
    count
}

/// Retry spilled records once the backoff window has elapsed.
async fn try_spill_recovery(
    shared: &Arc<Shared>,
    backoff: &mut Duration,
    next_retry: &mut Instant,
    config: &TrackerConfig,
) {
    if shared.spill.is_empty() || Instant::now() < *next_retry {
        return;
    }

    let records = match shared.spill.read_all() {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(error = %e, "spill read failed");
            return;
        }
    };
    if records.is_empty() {
        let _ = shared.spill.truncate();
        return;
    }

    match shared.store.append_steps(shared.task_id, &records).await {
        Ok(()) => {
            if let Err(e) = shared.spill.truncate() {
                tracing::error!(error = %e, "spill truncate failed after drain");
            }
            tracing::info!(task = %shared.task_id, count = records.len(), "recovered spilled steps");
            *backoff = config.retry_base;
            *next_retry = Instant::now();
        }
        Err(e) => {
            shared.store_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "spill retry failed, backing off {:?}", backoff);
            *next_retry = Instant::now() + *backoff;
            *backoff = (*backoff * 2).min(config.retry_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBlobStore, MemoryTaskStore, Page, StoreError, TaskStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;

    fn test_config(dir: &std::path::Path) -> TrackerConfig {
        TrackerConfig {
            capacity: 8,
            flush_interval: Duration::from_millis(50),
            spill_path: dir.join("steps.spill"),
            close_grace: Duration::from_secs(2),
            retry_base: Duration::from_millis(10),
            retry_max: Duration::from_millis(100),
        }
    }

    fn record(task_id: Uuid, n: u32) -> StepRecord {
        StepRecord {
            step_number: n,
            task_id,
            step_type: StepType::Action,
            payload: serde_json::json!({ "action": "back" }),
            thought: Some(format!("step {}", n)),
            outcome: StepOutcome::Success,
            screenshot_ref: None,
            elapsed_ms: 12,
            created_at: Utc::now(),
        }
    }

    /// Store that fails `append_steps` while the flag is set.
    struct FlakyStore {
        inner: MemoryTaskStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new(failing: bool) -> Self {
            Self {
                inner: MemoryTaskStore::new(),
                failing: AtomicBool::new(failing),
            }
        }
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn create_task(&self, task: &crate::storage::Task) -> Result<(), StoreError> {
            self.inner.create_task(task).await
        }

        async fn update_task_status(
            &self,
            task_id: Uuid,
            status: crate::storage::TaskStatus,
            end_time: Option<chrono::DateTime<Utc>>,
            result: Option<String>,
            error: Option<String>,
        ) -> Result<(), StoreError> {
            self.inner
                .update_task_status(task_id, status, end_time, result, error)
                .await
        }

        async fn append_steps(
            &self,
            task_id: Uuid,
            steps: &[StepRecord],
        ) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Io("injected failure".to_string()));
            }
            self.inner.append_steps(task_id, steps).await
        }

        async fn get_task(
            &self,
            task_id: Uuid,
        ) -> Result<Option<crate::storage::Task>, StoreError> {
            self.inner.get_task(task_id).await
        }

        async fn list_tasks(
            &self,
            filter: &crate::storage::TaskFilter,
            page: Page,
        ) -> Result<Vec<crate::storage::Task>, StoreError> {
            self.inner.list_tasks(filter, page).await
        }

        async fn get_steps(&self, task_id: Uuid, page: Page) -> Result<Vec<StepRecord>, StoreError> {
            self.inner.get_steps(task_id, page).await
        }

        async fn get_screenshots(&self, task_id: Uuid) -> Result<Vec<String>, StoreError> {
            self.inner.get_screenshots(task_id).await
        }
    }

    #[tokio::test]
    async fn test_append_flush_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryTaskStore::shared();
        let blobs = MemoryBlobStore::shared();
        let task_id = Uuid::new_v4();

        let tracker = StepTracker::new(
            task_id,
            store.clone(),
            blobs,
            test_config(dir.path()),
            None,
        )
        .unwrap();

        for n in 1..=5 {
            tracker.append(TrackedStep::bare(record(task_id, n)));
        }
        let flushed = tracker.flush(Some(Duration::from_secs(2))).await;
        assert_eq!(flushed, 5);

        let stored = store.get_steps(task_id, Page::default()).await.unwrap();
        let numbers: Vec<u32> = stored.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(tracker.close().await, 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryTaskStore::shared();
        let blobs = MemoryBlobStore::shared();
        let task_id = Uuid::new_v4();

        let overflowed = Arc::new(AtomicU64::new(0));
        let hook_count = overflowed.clone();
        let mut config = test_config(dir.path());
        config.capacity = 2;
        // long interval so nothing flushes while we overfill
        config.flush_interval = Duration::from_secs(60);

        let tracker = StepTracker::new(
            task_id,
            store.clone(),
            blobs,
            config,
            Some(Arc::new(move |n| {
                hook_count.fetch_add(n, Ordering::SeqCst);
            })),
        )
        .unwrap();

        for n in 1..=4 {
            tracker.append(TrackedStep::bare(record(task_id, n)));
        }
        assert_eq!(overflowed.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.dropped(), 2);

        tracker.flush(Some(Duration::from_secs(2))).await;
        let stored = store.get_steps(task_id, Page::default()).await.unwrap();
        let numbers: Vec<u32> = stored.iter().map(|s| s.step_number).collect();
        // oldest two were dropped, newest retained
        assert_eq!(numbers, vec![3, 4]);
        tracker.close().await;
    }

    #[tokio::test]
    async fn test_screenshot_upload_swaps_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryTaskStore::shared();
        let blobs = MemoryBlobStore::shared();
        let task_id = Uuid::new_v4();

        let tracker = StepTracker::new(
            task_id,
            store.clone(),
            blobs.clone(),
            test_config(dir.path()),
            None,
        )
        .unwrap();

        let key = screenshot_key(task_id, 1, Utc::now());
        let mut rec = record(task_id, 1);
        rec.screenshot_ref = Some(key.clone());
        tracker.append(TrackedStep {
            record: rec,
            screenshot: Some(ScreenshotBlob {
                key: key.clone(),
                bytes: vec![0x89, 0x50, 0x4e, 0x47],
            }),
        });

        tracker.flush(Some(Duration::from_secs(2))).await;

        assert_eq!(blobs.len(), 1);
        let stored = store.get_steps(task_id, Page::default()).await.unwrap();
        assert_eq!(
            stored[0].screenshot_ref.as_deref(),
            Some(format!("memory://{}", key).as_str())
        );
        let refs = store.get_screenshots(task_id).await.unwrap();
        assert_eq!(refs.len(), 1);
        tracker.close().await;
    }

    #[tokio::test]
    async fn test_store_failure_spills_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = MemoryBlobStore::shared();
        let task_id = Uuid::new_v4();
        let config = test_config(dir.path());

        // first run: store down, step must land in the spill
        let failing = Arc::new(FlakyStore::new(true));
        let tracker = StepTracker::new(
            task_id,
            failing.clone(),
            blobs.clone(),
            config.clone(),
            None,
        )
        .unwrap();
        tracker.append(TrackedStep::bare(record(task_id, 1)));
        tracker.flush(Some(Duration::from_secs(2))).await;
        assert!(tracker.store_errors() > 0);
        tracker.close().await;

        let spill = SpillFile::open(&config.spill_path).unwrap();
        assert!(!spill.is_empty(), "record must survive in the spill");

        // "restart": a new tracker over the same spill with a healthy store
        let healthy = Arc::new(FlakyStore::new(false));
        let tracker = StepTracker::new(task_id, healthy.clone(), blobs, config.clone(), None).unwrap();
        tracker.flush(Some(Duration::from_secs(2))).await;
        // allow a retry cycle in case the first wakeup raced the flush
        tokio::time::sleep(Duration::from_millis(200)).await;
        tracker.close().await;

        let stored = healthy
            .get_steps(task_id, Page::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1, "spilled step persisted exactly once");
        assert_eq!(stored[0].step_number, 1);

        let spill = SpillFile::open(&config.spill_path).unwrap();
        assert!(spill.is_empty(), "spill truncated after drain");
    }

    #[tokio::test]
    async fn test_flush_deadline_zero_steps() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StepTracker::new(
            Uuid::new_v4(),
            MemoryTaskStore::shared(),
            MemoryBlobStore::shared(),
            test_config(dir.path()),
            None,
        )
        .unwrap();
        assert_eq!(tracker.flush(Some(Duration::from_secs(1))).await, 0);
        tracker.close().await;
    }
}
