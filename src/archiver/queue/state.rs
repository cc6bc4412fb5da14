use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::warn;

use crate::archiver::domain::{ItemStatus, QueueItem, QueueMetrics};

/// Outcome of a finalize transition, used by the manager to decide on
/// write-through persistence and terminal-failure notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Completed,
    Retried,
    Failed,
}

/// All queue collections and indices, guarded by exactly one mutex in the
/// manager. Every URL lives in at most one of pending/processing/completed/
/// failed; the guild and channel indices track pending ∪ processing only.
#[derive(Default)]
pub struct QueueState {
    /// Sorted by `(−priority, added_at)`; claims pop from the front.
    pub pending: Vec<QueueItem>,
    pub processing: HashMap<String, QueueItem>,
    pub completed: HashMap<String, QueueItem>,
    pub failed: HashMap<String, QueueItem>,
    pub guild_index: HashMap<u64, HashSet<String>>,
    pub channel_index: HashMap<u64, HashSet<String>>,
    pub metrics: QueueMetrics,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_active(&self, url: &str) -> bool {
        self.processing.contains_key(url) || self.pending.iter().any(|item| item.url == url)
    }

    /// Insert at the position determined by the schedule key. Binary search
    /// keeps submits O(log n) under the lock.
    pub fn insert_pending(&mut self, mut item: QueueItem) {
        item.status = ItemStatus::Pending;
        let key = item.schedule_key();
        let index = self
            .pending
            .partition_point(|existing| existing.schedule_key() <= key);
        self.index_add(&item);
        self.pending.insert(index, item);
    }

    /// Claim the next item: move it from pending to processing, stamp its
    /// start time, and hand a working copy to the caller.
    pub fn claim_next(&mut self) -> Option<QueueItem> {
        if self.pending.is_empty() {
            return None;
        }
        let mut item = self.pending.remove(0);
        item.start_processing();
        self.processing.insert(item.url.clone(), item.clone());
        Some(item)
    }

    /// Return a worker's copy after an attempt and apply the retry-vs-fail
    /// decision. `max_retries` bounds the retry loop; retried items lose one
    /// priority step so they cannot starve newer work.
    pub fn finalize(
        &mut self,
        mut item: QueueItem,
        ok: bool,
        error: Option<&str>,
        max_retries: u32,
    ) -> FinalizeOutcome {
        if self.processing.remove(&item.url).is_none() {
            // Recovery or a guild clear may have moved the item already;
            // the worker's copy is stale and must not resurrect it.
            warn!(url = %item.url, "finalize for an item no longer in processing");
            self.metrics.touch_activity();
            return if ok {
                FinalizeOutcome::Completed
            } else {
                FinalizeOutcome::Failed
            };
        }

        item.finish_attempt(ok, error);
        let processing_time = item.processing_time;
        self.metrics.touch_activity();

        let outcome = if ok {
            item.status = ItemStatus::Completed;
            self.index_remove(&item);
            self.completed.insert(item.url.clone(), item);
            FinalizeOutcome::Completed
        } else if item.retry_count < max_retries {
            item.retry_count += 1;
            item.priority = item.priority.saturating_sub(1);
            item.last_retry = Some(Utc::now());
            // Still active: indices keep the URL, insert_pending re-adds it
            // idempotently.
            self.insert_pending(item);
            FinalizeOutcome::Retried
        } else {
            item.status = ItemStatus::Failed;
            self.index_remove(&item);
            self.failed.insert(item.url.clone(), item);
            FinalizeOutcome::Failed
        };

        self.metrics.update(processing_time, ok, error);
        outcome
    }

    /// Move a processing item back to pending, applying `mutate` first.
    /// Used by recovery and by shutdown requeueing.
    pub fn requeue_from_processing<F>(&mut self, url: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut QueueItem),
    {
        let Some(mut item) = self.processing.remove(url) else {
            return false;
        };
        mutate(&mut item);
        item.start_time = None;
        self.insert_pending(item);
        true
    }

    /// Move a processing item straight to failed with the given error.
    pub fn fail_from_processing(&mut self, url: &str, error: &str) -> bool {
        let Some(mut item) = self.processing.remove(url) else {
            return false;
        };
        item.status = ItemStatus::Failed;
        item.error = Some(error.to_string());
        item.last_error = Some(error.to_string());
        item.last_error_time = Some(Utc::now());
        item.start_time = None;
        self.index_remove(&item);
        self.metrics
            .update(item.processing_time, false, Some(error));
        self.failed.insert(url.to_string(), item);
        true
    }

    fn index_add(&mut self, item: &QueueItem) {
        self.guild_index
            .entry(item.guild_id)
            .or_default()
            .insert(item.url.clone());
        self.channel_index
            .entry(item.channel_id)
            .or_default()
            .insert(item.url.clone());
    }

    fn index_remove(&mut self, item: &QueueItem) {
        if let Some(urls) = self.guild_index.get_mut(&item.guild_id) {
            urls.remove(&item.url);
            if urls.is_empty() {
                self.guild_index.remove(&item.guild_id);
            }
        }
        if let Some(urls) = self.channel_index.get_mut(&item.channel_id) {
            urls.remove(&item.url);
            if urls.is_empty() {
                self.channel_index.remove(&item.channel_id);
            }
        }
    }

    /// Rebuild both indices from pending ∪ processing. Loaders call this
    /// because persisted indices are never trusted.
    pub fn rebuild_indices(&mut self) {
        self.guild_index.clear();
        self.channel_index.clear();
        let items: Vec<(u64, u64, String)> = self
            .pending
            .iter()
            .chain(self.processing.values())
            .map(|item| (item.guild_id, item.channel_id, item.url.clone()))
            .collect();
        for (guild_id, channel_id, url) in items {
            self.guild_index.entry(guild_id).or_default().insert(url.clone());
            self.channel_index.entry(channel_id).or_default().insert(url);
        }
    }

    /// Restore internal consistency after a load or an unexpected state:
    /// unique URLs across collections (processing wins over pending, older
    /// terminal entries win over active duplicates are not possible), sorted
    /// pending, statuses matching collections, fresh indices.
    pub fn repair_invariants(&mut self) {
        let mut seen: HashSet<String> = HashSet::new();
        seen.extend(self.processing.keys().cloned());
        self.pending.retain(|item| seen.insert(item.url.clone()));
        self.completed.retain(|url, _| !seen.contains(url));
        seen.extend(self.completed.keys().cloned());
        self.failed.retain(|url, _| !seen.contains(url));

        for item in &mut self.pending {
            item.status = ItemStatus::Pending;
            item.start_time = None;
        }
        for item in self.processing.values_mut() {
            item.status = ItemStatus::Processing;
            if item.start_time.is_none() {
                item.start_time = Some(Utc::now());
            }
        }

        self.pending.sort_by_key(QueueItem::schedule_key);
        self.rebuild_indices();
    }

    pub fn counts_for_guild(&self, guild_id: u64) -> (usize, usize, usize, usize) {
        (
            self.pending.iter().filter(|i| i.guild_id == guild_id).count(),
            self.processing
                .values()
                .filter(|i| i.guild_id == guild_id)
                .count(),
            self.completed
                .values()
                .filter(|i| i.guild_id == guild_id)
                .count(),
            self.failed
                .values()
                .filter(|i| i.guild_id == guild_id)
                .count(),
        )
    }

    /// Assert the structural invariants; test-only.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let mut seen: HashSet<&str> = HashSet::new();
        for item in &self.pending {
            assert!(seen.insert(&item.url), "duplicate url {}", item.url);
            assert_eq!(item.status, ItemStatus::Pending);
            assert!(item.start_time.is_none(), "pending item with start_time");
        }
        for (url, item) in &self.processing {
            assert!(seen.insert(url), "duplicate url {url}");
            assert_eq!(item.status, ItemStatus::Processing);
            assert!(item.start_time.is_some(), "processing item without start_time");
        }
        for url in self.completed.keys() {
            assert!(seen.insert(url), "duplicate url {url}");
        }
        for url in self.failed.keys() {
            assert!(seen.insert(url), "duplicate url {url}");
        }

        let mut sorted = self.pending.clone();
        sorted.sort_by_key(QueueItem::schedule_key);
        let order: Vec<&String> = self.pending.iter().map(|i| &i.url).collect();
        let expected: Vec<&String> = sorted.iter().map(|i| &i.url).collect();
        assert_eq!(order, expected, "pending not sorted");

        let mut expected_guilds: HashMap<u64, HashSet<String>> = HashMap::new();
        for item in self.pending.iter().chain(self.processing.values()) {
            expected_guilds
                .entry(item.guild_id)
                .or_default()
                .insert(item.url.clone());
        }
        assert_eq!(self.guild_index, expected_guilds, "guild index drifted");
    }
}
