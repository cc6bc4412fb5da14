//! Queue manager: the durable, priority-aware core of the pipeline.
//!
//! One mutex guards all queue collections and indices; workers, the
//! monitor, the recovery manager, and the cleaner coordinate through it
//! plus a condvar. Background threads (workers, monitor, cleaner,
//! snapshotter) all park on the process-wide shutdown signal.

pub mod cleaner;
pub mod monitor;
pub mod persistence;
pub mod recovery;
pub mod state;
mod worker;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::archiver::domain::{GuildQueueStatus, ItemStatus, QueueItem, QueueMetrics};
use crate::archiver::error::ArchiveError;
use crate::archiver::ffmpeg::process_registry;
use crate::archiver::processor::progress::ProgressTracker;
use crate::archiver::settings::{ArchiverSettings, QueueSettings};
use crate::archiver::shutdown::ShutdownSignal;
use crate::sync_ext::MutexExt;
use cleaner::QueueCleaner;
use monitor::{HealthView, QueueMonitor};
use persistence::{PersistedState, QueuePersistence};
use recovery::RecoveryManager;
use state::QueueState;

/// Per-item work callback. `handle` runs outside the queue lock; a `false`
/// result feeds the retry machinery. `on_terminal_failure` fires once when
/// an item conclusively fails, so hosts can flip the origin message's
/// indicator exactly once.
pub trait ItemHandler: Send + Sync {
    fn handle(&self, item: &mut QueueItem) -> (bool, Option<String>);

    fn on_terminal_failure(&self, _item: &QueueItem) {}
}

impl<F> ItemHandler for F
where
    F: Fn(&mut QueueItem) -> (bool, Option<String>) + Send + Sync,
{
    fn handle(&self, item: &mut QueueItem) -> (bool, Option<String>) {
        self(item)
    }
}

/// Shared state behind the manager facade.
pub struct Inner {
    pub(crate) state: Mutex<QueueState>,
    pub(crate) cv: Condvar,
    pub(crate) shutdown: Arc<ShutdownSignal>,
    pub(crate) settings: QueueSettings,
    pub(crate) persistence: Option<QueuePersistence>,
    pub(crate) cancelled: Mutex<HashSet<String>>,
    pub(crate) progress: Mutex<Option<Arc<ProgressTracker>>>,
}

impl Inner {
    /// Snapshot the queue state and write it out, without ever holding the
    /// queue lock across file I/O.
    pub(crate) fn persist_now(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let document = {
            let state = self.state.lock_unpoisoned();
            PersistedState::from_queue_state(&state)
        };
        if let Err(err) = persistence.write(&document) {
            error!(error = %format!("{err:#}"), "state snapshot failed");
        }
    }

    pub(crate) fn mark_cancelled(&self, url: &str) {
        self.cancelled.lock_unpoisoned().insert(url.to_string());
    }

    pub(crate) fn forget_cancelled(&self, url: &str) {
        self.cancelled.lock_unpoisoned().remove(url);
    }

    pub(crate) fn is_cancelled(&self, url: &str) -> bool {
        self.shutdown.is_triggered() || self.cancelled.lock_unpoisoned().contains(url)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(settings: QueueSettings) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            cv: Condvar::new(),
            shutdown: Arc::new(ShutdownSignal::new()),
            settings,
            persistence: None,
            cancelled: Mutex::new(HashSet::new()),
            progress: Mutex::new(None),
        }
    }
}

/// Handle for the processor to record pipeline-specific metric events that
/// are invisible to the finalize path, e.g. a hardware encoder falling back
/// while the item itself still succeeds.
#[derive(Clone)]
pub struct MetricsSink {
    inner: Arc<Inner>,
}

impl MetricsSink {
    pub fn record_hardware_accel_failure(&self) {
        let mut state = self.inner.state.lock_unpoisoned();
        state.metrics.hardware_accel_failures += 1;
    }

    pub fn record_compression_failure(&self) {
        let mut state = self.inner.state.lock_unpoisoned();
        state.metrics.compression_failures += 1;
    }

    pub fn touch_activity(&self) {
        let mut state = self.inner.state.lock_unpoisoned();
        state.metrics.touch_activity();
    }
}

/// The queue manager facade: submit, run, status, clear, shutdown.
pub struct QueueManager {
    inner: Arc<Inner>,
    monitor: Arc<QueueMonitor>,
    recovery: Arc<RecoveryManager>,
    cleaner: Arc<QueueCleaner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl QueueManager {
    /// Build a manager from settings, loading persisted state when a state
    /// file is configured. An unreadable state file (primary and all
    /// backups) logs an error and starts fresh; a missing one is normal.
    pub fn new(settings: &ArchiverSettings, shutdown: Arc<ShutdownSignal>) -> Self {
        let persistence = settings
            .persistence
            .path
            .clone()
            .map(|path| QueuePersistence::new(path, settings.persistence.clone()));

        let state = match persistence.as_ref().map(QueuePersistence::load) {
            Some(Ok(Some(state))) => state,
            Some(Ok(None)) | None => QueueState::new(),
            Some(Err(err)) => {
                error!(error = %format!("{err:#}"), "starting with a fresh queue state");
                QueueState::new()
            }
        };

        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            cv: Condvar::new(),
            shutdown: shutdown.clone(),
            settings: settings.queue.clone(),
            persistence,
            cancelled: Mutex::new(HashSet::new()),
            progress: Mutex::new(None),
        });

        Self {
            inner,
            monitor: Arc::new(QueueMonitor::new(settings.monitor.clone())),
            recovery: Arc::new(RecoveryManager::new(
                settings.recovery.clone(),
                settings.queue.max_retries,
                shutdown,
            )),
            cleaner: Arc::new(QueueCleaner::new(settings.cleaner.clone())),
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Enqueue a URL for archiving. Duplicates of pending/processing URLs
    /// are rejected; completed/failed URLs may be resubmitted.
    pub fn submit(
        &self,
        url: impl Into<String>,
        message_id: u64,
        channel_id: u64,
        guild_id: u64,
        author_id: u64,
        priority: u8,
    ) -> Result<bool, ArchiveError> {
        if self.inner.shutdown.is_triggered() {
            return Err(ArchiveError::Shutdown);
        }
        let url = url.into();

        {
            let mut state = self.inner.state.lock_unpoisoned();
            if state.contains_active(&url) {
                return Err(ArchiveError::Duplicate(url));
            }
            if state.pending.len() >= self.inner.settings.max_queue_size {
                return Err(ArchiveError::QueueFull);
            }
            // Resubmission of a finished URL starts a new lifecycle.
            state.completed.remove(&url);
            state.failed.remove(&url);

            let item = QueueItem::new(url.clone(), message_id, channel_id, guild_id, author_id, priority);
            state.insert_pending(item);
            state.metrics.touch_activity();
        }

        debug!(%url, priority, "submitted to queue");
        self.inner.persist_now();
        self.inner.cv.notify_one();
        Ok(true)
    }

    /// Start the worker pool and the background loops. Idempotent; the
    /// second call is a no-op.
    pub fn run(&self, handler: Arc<dyn ItemHandler>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("queue manager already running");
            return;
        }

        let mut handles =
            worker::spawn_workers(&self.inner, handler, self.inner.settings.effective_workers());
        handles.extend(self.spawn_monitor_loop());
        handles.extend(self.spawn_cleaner_loop());
        handles.extend(self.spawn_snapshot_loop());
        self.handles.lock_unpoisoned().extend(handles);
    }

    fn spawn_monitor_loop(&self) -> Option<JoinHandle<()>> {
        let inner = self.inner.clone();
        let monitor = self.monitor.clone();
        let recovery = self.recovery.clone();
        std::thread::Builder::new()
            .name("archiver-monitor".to_string())
            .spawn(move || {
                loop {
                    if inner.shutdown.wait_timeout(monitor.check_interval()) {
                        break;
                    }

                    let view = {
                        let state = inner.state.lock_unpoisoned();
                        let metrics = &state.metrics;
                        HealthView {
                            pending_len: state.pending.len(),
                            processing: state
                                .processing
                                .values()
                                .map(|i| (i.url.clone(), i.start_time, i.retry_count))
                                .collect(),
                            success_rate: metrics.success_rate,
                            total_processed: metrics.total_processed,
                            error_rate: if metrics.total_processed > 0 {
                                metrics.total_failed as f64 / metrics.total_processed as f64
                            } else {
                                0.0
                            },
                            last_activity: metrics.last_activity,
                        }
                    };

                    let report = monitor.tick(&view);
                    {
                        let mut state = inner.state.lock_unpoisoned();
                        state.metrics.record_memory_sample(report.memory_mb);
                    }

                    if report.hung {
                        recovery.perform_emergency_recovery(&inner);
                        let mut state = inner.state.lock_unpoisoned();
                        state.metrics.touch_activity();
                    } else if !report.stuck_urls.is_empty() {
                        recovery.recover_stuck_items(&inner, &report.stuck_urls);
                    }
                }
                debug!("monitor loop stopped");
            })
            .map_err(|err| error!(error = %err, "failed to spawn monitor thread"))
            .ok()
    }

    fn spawn_cleaner_loop(&self) -> Option<JoinHandle<()>> {
        let inner = self.inner.clone();
        let cleaner = self.cleaner.clone();
        std::thread::Builder::new()
            .name("archiver-cleaner".to_string())
            .spawn(move || {
                // Tick faster than the cleanup interval so the emergency
                // trigger is observed promptly.
                let tick = Duration::from_secs(
                    cleaner.settings().cleanup_interval_secs.clamp(1, 60),
                );
                let interval = Duration::from_secs(cleaner.settings().cleanup_interval_secs);
                let mut last_full_pass = Instant::now();

                loop {
                    if inner.shutdown.wait_timeout(tick) {
                        break;
                    }

                    let pending_len = {
                        let state = inner.state.lock_unpoisoned();
                        state.pending.len()
                    };
                    let emergency = cleaner.should_run_emergency(pending_len);
                    if !emergency && last_full_pass.elapsed() < interval {
                        continue;
                    }
                    last_full_pass = Instant::now();

                    // HISTORY and TRACKING phases each take the lock
                    // separately so workers are not stalled.
                    {
                        let mut state = inner.state.lock_unpoisoned();
                        cleaner.history_pass(&mut state);
                    }
                    {
                        let mut state = inner.state.lock_unpoisoned();
                        cleaner.tracking_pass(&mut state);
                    }
                    let tracker = inner.progress.lock_unpoisoned().clone();
                    if let Some(tracker) = tracker {
                        tracker.remove_inactive();
                    }
                    inner.persist_now();
                }
                debug!("cleaner loop stopped");
            })
            .map_err(|err| error!(error = %err, "failed to spawn cleaner thread"))
            .ok()
    }

    fn spawn_snapshot_loop(&self) -> Option<JoinHandle<()>> {
        let inner = self.inner.clone();
        std::thread::Builder::new()
            .name("archiver-snapshot".to_string())
            .spawn(move || {
                let interval = Duration::from_secs(inner.settings.persist_interval_secs.max(1));
                loop {
                    if inner.shutdown.wait_timeout(interval) {
                        break;
                    }
                    inner.persist_now();
                }
                debug!("snapshot loop stopped");
            })
            .map_err(|err| error!(error = %err, "failed to spawn snapshot thread"))
            .ok()
    }

    /// Counts and metrics for a guild.
    pub fn status(&self, guild_id: u64) -> GuildQueueStatus {
        let state = self.inner.state.lock_unpoisoned();
        let (pending, processing, completed, failed) = state.counts_for_guild(guild_id);
        GuildQueueStatus {
            pending,
            processing,
            completed,
            failed,
            metrics: state.metrics.clone(),
        }
    }

    /// Remove every item belonging to a guild. In-flight items are marked
    /// cancelled so the processor abandons them at its next suspension
    /// point; their late finalize calls become no-ops.
    pub fn clear(&self, guild_id: u64) -> usize {
        {
            let state = self.inner.state.lock_unpoisoned();
            for item in state.processing.values() {
                if item.guild_id == guild_id {
                    self.inner.mark_cancelled(&item.url);
                }
            }
        }
        let cleared = self.cleaner.guild_clear(&self.inner, guild_id);
        self.inner.persist_now();
        cleared
    }

    /// Stop accepting work, drain workers within `timeout`, requeue
    /// interrupted items that still have retries left, snapshot, and
    /// force-kill stragglers when the drain budget runs out.
    pub fn shutdown(&self, timeout: Duration) {
        info!("queue manager shutting down");
        self.inner.shutdown.trigger();
        self.inner.cv.notify_all();

        let deadline = Instant::now() + timeout;
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock_unpoisoned());
        let mut drained = true;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                drained = false;
            }
        }

        {
            let mut state = self.inner.state.lock_unpoisoned();
            let urls: Vec<String> = state.processing.keys().cloned().collect();
            for url in urls {
                let retries = state
                    .processing
                    .get(&url)
                    .map(|item| item.retry_count)
                    .unwrap_or(0);
                if retries < self.inner.settings.max_retries {
                    state.requeue_from_processing(&url, |item| {
                        item.retry_count += 1;
                        item.status = ItemStatus::Pending;
                    });
                } else {
                    state.fail_from_processing(&url, "Shutdown: processing interrupted");
                }
            }
        }

        self.inner.persist_now();

        if !drained {
            warn!("worker drain exceeded the timeout; forcing cleanup");
            process_registry::terminate_all();
            process_registry::kill_orphaned_ffmpeg();
        }
        info!("queue manager stopped");
    }

    pub fn metrics_sink(&self) -> MetricsSink {
        MetricsSink {
            inner: self.inner.clone(),
        }
    }

    /// Closure the processor polls between pipeline steps; true means the
    /// item was cancelled by shutdown or a guild clear.
    pub fn cancel_check(&self) -> Arc<dyn Fn(&str) -> bool + Send + Sync> {
        let inner = self.inner.clone();
        Arc::new(move |url: &str| inner.is_cancelled(url))
    }

    /// Let the cleaner reap finished progress entries.
    pub fn attach_progress_tracker(&self, tracker: Arc<ProgressTracker>) {
        *self.inner.progress.lock_unpoisoned() = Some(tracker);
    }

    pub fn metrics_snapshot(&self) -> QueueMetrics {
        self.inner.state.lock_unpoisoned().metrics.clone()
    }

    /// `(pending, processing, completed, failed)` across all guilds.
    pub fn global_counts(&self) -> (usize, usize, usize, usize) {
        let state = self.inner.state.lock_unpoisoned();
        (
            state.pending.len(),
            state.processing.len(),
            state.completed.len(),
            state.failed.len(),
        )
    }

    pub fn item_status(&self, url: &str) -> Option<ItemStatus> {
        let state = self.inner.state.lock_unpoisoned();
        if state.pending.iter().any(|item| item.url == url) {
            Some(ItemStatus::Pending)
        } else if state.processing.contains_key(url) {
            Some(ItemStatus::Processing)
        } else if state.completed.contains_key(url) {
            Some(ItemStatus::Completed)
        } else if state.failed.contains_key(url) {
            Some(ItemStatus::Failed)
        } else {
            None
        }
    }

    /// Block until no pending or processing work remains, with a deadline.
    /// Returns false on timeout. Primarily for hosts draining before exit
    /// and for integration tests.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let (pending, processing, _, _) = self.global_counts();
            if pending == 0 && processing == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Force a snapshot immediately; used by hosts at checkpoints.
    pub fn snapshot_now(&self) {
        self.inner.persist_now();
    }
}
