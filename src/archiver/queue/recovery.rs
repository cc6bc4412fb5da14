use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::archiver::domain::QueueItem;
use crate::archiver::ffmpeg::process_registry;
use crate::archiver::queue::Inner;
use crate::archiver::settings::{RecoveryPolicy, RecoverySettings};
use crate::archiver::shutdown::ShutdownSignal;
use crate::sync_ext::MutexExt;

const RECOVERY_HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Retry,
    Fail,
    Requeue,
    Emergency,
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub url: String,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Applies recovery strategies to stuck processing items.
///
/// Passes are serialized by an internal lock and bounded per pass by
/// `max_concurrent_recoveries`; leftover stuck items are picked up on the
/// next monitor tick. Requeue backoff waits on the shutdown signal, so a
/// stopping process never sits in a recovery sleep.
pub struct RecoveryManager {
    settings: RecoverySettings,
    max_retries: u32,
    pass_lock: Mutex<()>,
    history: Mutex<VecDeque<RecoveryResult>>,
    shutdown: Arc<ShutdownSignal>,
}

impl RecoveryManager {
    pub fn new(
        settings: RecoverySettings,
        max_retries: u32,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            settings,
            max_retries,
            pass_lock: Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
            shutdown,
        }
    }

    /// Strategy table: exhausted retries fail, ancient items get emergency
    /// treatment, otherwise the policy decides between retry and requeue.
    pub fn determine_strategy(&self, item: &QueueItem, now: DateTime<Utc>) -> RecoveryStrategy {
        if item.retry_count >= self.max_retries {
            return RecoveryStrategy::Fail;
        }

        let processing_age = item
            .start_time
            .map(|start| (now - start).num_seconds())
            .unwrap_or(0);
        if processing_age > self.settings.emergency_threshold_secs {
            return RecoveryStrategy::Emergency;
        }

        match self.settings.policy {
            RecoveryPolicy::Aggressive => RecoveryStrategy::Retry,
            RecoveryPolicy::Conservative => RecoveryStrategy::Requeue,
            RecoveryPolicy::Balanced => {
                if item.retry_count < self.max_retries / 2 {
                    RecoveryStrategy::Retry
                } else {
                    RecoveryStrategy::Requeue
                }
            }
        }
    }

    /// Capped exponential backoff before a requeue reinsertion.
    pub fn requeue_backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let delay = self.settings.backoff_base_secs.saturating_mul(1u64 << exponent);
        Duration::from_secs(delay.min(self.settings.max_backoff_secs))
    }

    /// Recover up to `max_concurrent_recoveries` of the given stuck items.
    /// Returns `(recovered, failed)` counts.
    pub fn recover_stuck_items(&self, inner: &Inner, stuck_urls: &[String]) -> (usize, usize) {
        let _pass = self.pass_lock.lock_unpoisoned();
        let now = Utc::now();
        let mut recovered = 0;
        let mut failed = 0;

        for url in stuck_urls.iter().take(self.settings.max_concurrent_recoveries) {
            if self.shutdown.is_triggered() {
                break;
            }

            let Some(item) = ({
                let state = inner.state.lock_unpoisoned();
                state.processing.get(url).cloned()
            }) else {
                // Finalized or cleared while we were deciding; nothing to do.
                continue;
            };

            let strategy = self.determine_strategy(&item, now);
            let success = self.execute(inner, url, &item, strategy);
            if success {
                recovered += 1;
            } else {
                failed += 1;
            }
            self.record(RecoveryResult {
                url: url.clone(),
                strategy,
                success,
                retry_count: item.retry_count,
                timestamp: Utc::now(),
            });
        }

        if recovered + failed > 0 {
            info!(recovered, failed, "recovery pass complete");
            inner.cv.notify_all();
        }
        (recovered, failed)
    }

    /// Emergency sweep of the entire processing set, triggered when the
    /// activity check reports the queue as hung.
    pub fn perform_emergency_recovery(&self, inner: &Inner) {
        warn!("performing emergency recovery of all processing items");
        let urls: Vec<String> = {
            let state = inner.state.lock_unpoisoned();
            state.processing.keys().cloned().collect()
        };
        // Chunk through the set so the per-pass bound still applies.
        for chunk in urls.chunks(self.settings.max_concurrent_recoveries.max(1)) {
            if self.shutdown.is_triggered() {
                break;
            }
            self.recover_stuck_items(inner, chunk);
        }
    }

    fn execute(
        &self,
        inner: &Inner,
        url: &str,
        item: &QueueItem,
        strategy: RecoveryStrategy,
    ) -> bool {
        match strategy {
            RecoveryStrategy::Fail => {
                warn!(url, "moving stuck item to failed");
                let mut state = inner.state.lock_unpoisoned();
                state.fail_from_processing(url, "Timeout: exceeded maximum retries after being stuck")
            }
            RecoveryStrategy::Retry => {
                info!(url, "recovering stuck item for retry");
                let mut state = inner.state.lock_unpoisoned();
                state.requeue_from_processing(url, |item| {
                    item.retry_count += 1;
                    item.processing_time = 0.0;
                    item.last_retry = Some(Utc::now());
                    item.priority = item.priority.saturating_sub(2);
                })
            }
            RecoveryStrategy::Requeue => {
                info!(url, "requeueing stuck item with backoff");
                let backoff = self.requeue_backoff(item.retry_count + 1);
                // The item stays visible in processing during the backoff so
                // no worker can double-claim the URL.
                if self.shutdown.wait_timeout(backoff) {
                    return false;
                }
                let mut state = inner.state.lock_unpoisoned();
                state.requeue_from_processing(url, |item| {
                    item.retry_count += 1;
                    item.processing_time = 0.0;
                    item.last_retry = Some(Utc::now());
                    item.priority = 0;
                })
            }
            RecoveryStrategy::Emergency => {
                warn!(url, "emergency recovery: forcing subprocess cleanup");
                process_registry::terminate_all();
                let mut state = inner.state.lock_unpoisoned();
                state.requeue_from_processing(url, |item| {
                    item.retry_count = 0;
                    item.processing_time = 0.0;
                    item.priority = 10;
                })
            }
        }
    }

    fn record(&self, result: RecoveryResult) {
        let mut history = self.history.lock_unpoisoned();
        history.push_back(result);
        if history.len() > RECOVERY_HISTORY_CAP {
            history.pop_front();
        }
    }

    pub fn recent_results(&self, n: usize) -> Vec<RecoveryResult> {
        self.history
            .lock_unpoisoned()
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }
}
