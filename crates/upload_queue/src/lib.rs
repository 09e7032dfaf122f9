use std::{
    cell::Cell,
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{oneshot, watch},
};
use tracing::{debug, info, warn};

pub use shared::{
    domain::{FilePayload, PayloadSource, QueueStats, UploadId, UploadStatus},
    error::UploadError,
    protocol::{UploadOptions, UploadResponse, DEFAULT_FIELD_NAME},
};
pub use upload_transport::{
    HttpTransportConfig, HttpUploadTransport, ProgressCallback, UploadTransport,
};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// One file's upload task. Callers only ever see clones; the queue owns the
/// live record.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: UploadId,
    pub file: FilePayload,
    pub options: UploadOptions,
    pub status: UploadStatus,
    pub progress: u8,
    pub error: Option<UploadError>,
    pub result: Option<UploadResponse>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    fn new(file: FilePayload, options: UploadOptions) -> Self {
        Self {
            id: UploadId::new(),
            file,
            options,
            status: UploadStatus::Queued,
            progress: 0,
            error: None,
            result: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn set_status(&mut self, next: UploadStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "invalid upload transition {} -> {next}",
            self.status
        );
        self.status = next;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("max_concurrent must be at least 1, got {0}")]
    InvalidConcurrency(usize),
    #[error("upload queue must be built inside a tokio runtime")]
    NoRuntime,
}

type ItemListener = Arc<dyn Fn(&QueueItem) + Send + Sync>;
type StatsListener = Arc<dyn Fn(&QueueStats) + Send + Sync>;

#[derive(Clone)]
struct QueueListeners {
    on_progress: ItemListener,
    on_complete: ItemListener,
    on_error: ItemListener,
    on_queue_update: StatsListener,
}

impl Default for QueueListeners {
    fn default() -> Self {
        Self {
            on_progress: Arc::new(|_| {}),
            on_complete: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            on_queue_update: Arc::new(|_| {}),
        }
    }
}

pub struct UploadQueueBuilder {
    transport: Arc<dyn UploadTransport>,
    max_concurrent: usize,
    listeners: QueueListeners,
}

impl UploadQueueBuilder {
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn on_progress(mut self, listener: impl Fn(&QueueItem) + Send + Sync + 'static) -> Self {
        self.listeners.on_progress = Arc::new(listener);
        self
    }

    pub fn on_complete(mut self, listener: impl Fn(&QueueItem) + Send + Sync + 'static) -> Self {
        self.listeners.on_complete = Arc::new(listener);
        self
    }

    pub fn on_error(mut self, listener: impl Fn(&QueueItem) + Send + Sync + 'static) -> Self {
        self.listeners.on_error = Arc::new(listener);
        self
    }

    pub fn on_queue_update(
        mut self,
        listener: impl Fn(&QueueStats) + Send + Sync + 'static,
    ) -> Self {
        self.listeners.on_queue_update = Arc::new(listener);
        self
    }

    /// Must be called from within a tokio runtime; uploads are spawned onto it.
    pub fn build(self) -> Result<UploadQueue, QueueError> {
        if self.max_concurrent == 0 {
            return Err(QueueError::InvalidConcurrency(self.max_concurrent));
        }
        let runtime = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let (stats_tx, _) = watch::channel(QueueStats::default());

        Ok(UploadQueue {
            inner: Arc::new(QueueInner {
                transport: self.transport,
                max_concurrent: self.max_concurrent,
                runtime,
                listeners: self.listeners,
                state: Mutex::new(QueueState::default()),
                stats_tx,
                stats_seq: AtomicU64::new(0),
                delivered_seq: ReentrantMutex::new(Cell::new(0)),
            }),
        })
    }
}

/// Bounded-concurrency upload queue.
///
/// Items start in insertion order whenever fewer than `max_concurrent`
/// uploads are in flight. Bookkeeping happens under a single lock that is
/// never held across an await; listeners run after the lock is released.
/// `on_queue_update` sees stats in the order they were produced and never
/// receives a snapshot older than one it has already been given.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    transport: Arc<dyn UploadTransport>,
    max_concurrent: usize,
    runtime: Handle,
    listeners: QueueListeners,
    state: Mutex<QueueState>,
    stats_tx: watch::Sender<QueueStats>,
    // Bumped under `state`, so sequence order is the order stats were taken.
    stats_seq: AtomicU64,
    // Serializes listener delivery. Reentrant so a listener may call back
    // into the queue on the same thread.
    delivered_seq: ReentrantMutex<Cell<u64>>,
}

/// Stats taken under the state lock, stamped with their publish order.
#[derive(Debug, Clone, Copy)]
struct Published {
    seq: u64,
    stats: QueueStats,
}

#[derive(Default)]
struct QueueState {
    items: Vec<QueueItem>,
    active: HashSet<UploadId>,
    completed: HashSet<UploadId>,
    failed: HashSet<UploadId>,
    // Dropping or firing a sender aborts that upload's task.
    in_flight: HashMap<UploadId, oneshot::Sender<()>>,
}

impl QueueState {
    fn position(&self, id: UploadId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn item_mut(&mut self, id: UploadId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn abort_in_flight(&mut self, id: UploadId) {
        if let Some(cancel) = self.in_flight.remove(&id) {
            let _ = cancel.send(());
        }
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.items.len(),
            active: self.active.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            ..QueueStats::default()
        };
        for item in &self.items {
            match item.status {
                UploadStatus::Queued => stats.queued += 1,
                UploadStatus::Cancelled => stats.cancelled += 1,
                _ => {}
            }
        }
        stats
    }
}

enum Notice {
    Completed(QueueItem),
    Failed(QueueItem),
}

impl UploadQueue {
    pub fn builder(transport: Arc<dyn UploadTransport>) -> UploadQueueBuilder {
        UploadQueueBuilder {
            transport,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            listeners: QueueListeners::default(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Queues one item per file and starts as many as free slots allow.
    /// Options are not validated here; a bad endpoint shows up as a failed
    /// item.
    pub fn add_files<I>(&self, files: I, options: UploadOptions) -> Vec<UploadId>
    where
        I: IntoIterator<Item = FilePayload>,
    {
        let (ids, published) = {
            let mut state = self.inner.state.lock();
            let ids: Vec<UploadId> = files
                .into_iter()
                .map(|file| {
                    let item = QueueItem::new(file, options.clone());
                    let id = item.id;
                    state.items.push(item);
                    id
                })
                .collect();
            debug!(count = ids.len(), endpoint = %options.endpoint, "files queued");
            self.inner.process_queue(&mut state);
            (ids, self.inner.publish_stats(&state))
        };
        self.inner.notify(None, published);
        ids
    }

    /// Drops an item whatever its status. An in-flight upload is aborted and
    /// its slot handed to the next queued item.
    pub fn remove_file(&self, id: UploadId) -> bool {
        let published = {
            let mut state = self.inner.state.lock();
            let Some(index) = state.position(id) else {
                return false;
            };
            let item = state.items.remove(index);
            state.active.remove(&id);
            state.completed.remove(&id);
            state.failed.remove(&id);
            state.abort_in_flight(id);
            debug!(upload_id = %id, status = %item.status, "upload removed");
            self.inner.process_queue(&mut state);
            self.inner.publish_stats(&state)
        };
        self.inner.notify(None, published);
        true
    }

    pub fn clear_queue(&self) {
        let published = {
            let mut state = self.inner.state.lock();
            for (_, cancel) in state.in_flight.drain() {
                let _ = cancel.send(());
            }
            *state = QueueState::default();
            self.inner.publish_stats(&state)
        };
        debug!("queue cleared");
        self.inner.notify(None, published);
    }

    /// Requeues every failed item. Returns how many were requeued.
    pub fn retry_failed(&self) -> usize {
        let (retried, published) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut retried = 0;
            for item in state
                .items
                .iter_mut()
                .filter(|item| item.status == UploadStatus::Failed)
            {
                item.set_status(UploadStatus::Queued);
                item.error = None;
                item.progress = 0;
                item.started_at = None;
                item.finished_at = None;
                state.failed.remove(&item.id);
                retried += 1;
            }
            if retried > 0 {
                debug!(retried, "failed uploads requeued");
            }
            self.inner.process_queue(state);
            (retried, self.inner.publish_stats(state))
        };
        self.inner.notify(None, published);
        retried
    }

    /// Cancels every in-flight upload and hands the freed slots to queued
    /// items. Returns how many uploads were cancelled.
    pub fn cancel_all(&self) -> usize {
        let (cancelled, published) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let now = Utc::now();
            let mut cancelled = 0;
            for item in state
                .items
                .iter_mut()
                .filter(|item| item.status == UploadStatus::Uploading)
            {
                item.set_status(UploadStatus::Cancelled);
                item.finished_at = Some(now);
                state.active.remove(&item.id);
                if let Some(cancel) = state.in_flight.remove(&item.id) {
                    let _ = cancel.send(());
                }
                cancelled += 1;
            }
            if cancelled > 0 {
                info!(cancelled, "in-flight uploads cancelled");
            }
            self.inner.process_queue(state);
            (cancelled, self.inner.publish_stats(state))
        };
        self.inner.notify(None, published);
        cancelled
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.inner.state.lock().items.clone()
    }

    pub fn item(&self, id: UploadId) -> Option<QueueItem> {
        let state = self.inner.state.lock();
        state.items.iter().find(|item| item.id == id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.state.lock().stats()
    }

    /// Latest stats, updated under the queue lock.
    pub fn subscribe_stats(&self) -> watch::Receiver<QueueStats> {
        self.inner.stats_tx.subscribe()
    }

    /// Resolves once nothing is queued or uploading.
    pub async fn wait_until_idle(&self) {
        let mut stats = self.subscribe_stats();
        let _ = stats.wait_for(QueueStats::is_idle).await;
    }
}

impl QueueInner {
    fn process_queue(self: &Arc<Self>, state: &mut QueueState) {
        while state.active.len() < self.max_concurrent {
            let Some(item) = state
                .items
                .iter_mut()
                .find(|item| item.status == UploadStatus::Queued)
            else {
                break;
            };

            item.set_status(UploadStatus::Uploading);
            item.progress = 0;
            item.started_at = Some(Utc::now());
            item.finished_at = None;
            let id = item.id;
            let file = item.file.clone();
            let options = item.options.clone();

            let (cancel_tx, cancel_rx) = oneshot::channel();
            state.active.insert(id);
            state.in_flight.insert(id, cancel_tx);
            debug!(upload_id = %id, file = %file.file_name, "upload started");

            self.runtime
                .spawn(Arc::clone(self).run_upload(id, file, options, cancel_rx));
        }
    }

    async fn run_upload(
        self: Arc<Self>,
        id: UploadId,
        file: FilePayload,
        options: UploadOptions,
        cancel: oneshot::Receiver<()>,
    ) {
        let progress_target = Arc::clone(&self);
        let progress: ProgressCallback =
            Arc::new(move |percent| progress_target.record_progress(id, percent));

        let outcome = tokio::select! {
            result = self.transport.upload(&file, &options, progress) => result,
            _ = cancel => Err(UploadError::Aborted),
        };
        self.finish(id, outcome);
    }

    fn record_progress(&self, id: UploadId, percent: u8) {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(item) = state
                .item_mut(id)
                .filter(|item| item.status == UploadStatus::Uploading)
            else {
                return;
            };
            item.progress = percent.min(100);
            item.clone()
        };
        (self.listeners.on_progress)(&snapshot);
    }

    fn finish(self: &Arc<Self>, id: UploadId, outcome: Result<UploadResponse, UploadError>) {
        let (notice, published) = {
            let mut state = self.state.lock();
            let Some(index) = state.position(id) else {
                debug!(upload_id = %id, "outcome for removed upload ignored");
                return;
            };
            if state.items[index].status != UploadStatus::Uploading {
                debug!(
                    upload_id = %id,
                    status = %state.items[index].status,
                    "outcome for inactive upload ignored"
                );
                return;
            }

            state.active.remove(&id);
            state.in_flight.remove(&id);

            let item = &mut state.items[index];
            item.finished_at = Some(Utc::now());
            let notice = match outcome {
                Ok(response) => {
                    item.set_status(UploadStatus::Completed);
                    item.progress = 100;
                    item.error = None;
                    item.result = Some(response);
                    info!(upload_id = %id, file = %item.file.file_name, "upload completed");
                    let snapshot = item.clone();
                    state.completed.insert(id);
                    Notice::Completed(snapshot)
                }
                Err(error) => {
                    warn!(
                        upload_id = %id,
                        file = %item.file.file_name,
                        error = %error,
                        "upload failed"
                    );
                    item.set_status(UploadStatus::Failed);
                    item.error = Some(error);
                    let snapshot = item.clone();
                    state.failed.insert(id);
                    Notice::Failed(snapshot)
                }
            };

            self.process_queue(&mut state);
            (notice, self.publish_stats(&state))
        };
        self.notify(Some(notice), published);
    }

    /// Must be called with the state lock held.
    fn publish_stats(&self, state: &QueueState) -> Published {
        let stats = state.stats();
        let seq = self.stats_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats_tx.send_replace(stats);
        Published { seq, stats }
    }

    /// Must be called after the state lock is released.
    fn notify(&self, notice: Option<Notice>, published: Published) {
        let delivered = self.delivered_seq.lock();
        match notice {
            Some(Notice::Completed(item)) => (self.listeners.on_complete)(&item),
            Some(Notice::Failed(item)) => (self.listeners.on_error)(&item),
            None => {}
        }
        if published.seq <= delivered.get() {
            debug!(seq = published.seq, "superseded stats update dropped");
            return;
        }
        delivered.set(published.seq);
        (self.listeners.on_queue_update)(&published.stats);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
