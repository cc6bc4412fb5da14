use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info};

use crate::archiver::domain::QueueItem;
use crate::archiver::queue::Inner;
use crate::archiver::settings::{
    CleanerSettings, CleanupAggressiveness, GuildCleanupStrategy, HistoryPolicy,
};
use crate::sync_ext::MutexExt;

/// Timestamp used for age decisions: the freshest thing we know about the
/// item. Items never touched after submit age from `added_at`.
fn age_reference(item: &QueueItem) -> DateTime<Utc> {
    let mut reference = item.added_at;
    for candidate in [item.last_retry, item.last_error_time, item.start_time] {
        if let Some(ts) = candidate
            && ts > reference
        {
            reference = ts;
        }
    }
    reference
}

/// Bounded history/tracking eviction.
///
/// Phases run under separate short lock acquisitions (HISTORY, TRACKING,
/// and on-demand GUILD) so workers are never blocked for long. The
/// emergency trigger is rate-limited to one pass per
/// `emergency_min_interval_secs`.
pub struct QueueCleaner {
    settings: CleanerSettings,
    last_emergency: Mutex<Option<DateTime<Utc>>>,
}

impl QueueCleaner {
    pub fn new(settings: CleanerSettings) -> Self {
        Self {
            settings,
            last_emergency: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &CleanerSettings {
        &self.settings
    }

    /// HISTORY phase: evict old completed/failed entries per policy, never
    /// younger than the retention floor.
    pub fn history_pass(&self, state: &mut crate::archiver::queue::state::QueueState) -> usize {
        let now = Utc::now();
        let by_age = self.candidates_by_age(state, now);
        let by_size = self.candidates_by_size(state, now);

        let evict: HashSet<String> = match self.settings.history_policy {
            HistoryPolicy::Age => by_age,
            HistoryPolicy::Size => by_size,
            HistoryPolicy::Hybrid => match self.settings.aggressiveness {
                CleanupAggressiveness::Aggressive => by_age.union(&by_size).cloned().collect(),
                CleanupAggressiveness::Conservative => {
                    by_age.intersection(&by_size).cloned().collect()
                }
                CleanupAggressiveness::Balanced => by_age,
            },
        };

        let before = state.completed.len() + state.failed.len();
        state.completed.retain(|url, _| !evict.contains(url));
        state.failed.retain(|url, _| !evict.contains(url));
        let evicted = before - (state.completed.len() + state.failed.len());
        if evicted > 0 {
            info!(evicted, "history cleanup evicted entries");
        }
        evicted
    }

    fn within_retention(&self, item: &QueueItem, now: DateTime<Utc>) -> bool {
        (now - age_reference(item)).num_seconds() < self.settings.min_retention_secs
    }

    fn candidates_by_age(
        &self,
        state: &crate::archiver::queue::state::QueueState,
        now: DateTime<Utc>,
    ) -> HashSet<String> {
        let cutoff = now - ChronoDuration::seconds(self.settings.max_history_age_secs);
        state
            .completed
            .values()
            .chain(state.failed.values())
            .filter(|item| age_reference(item) < cutoff && !self.within_retention(item, now))
            .map(|item| item.url.clone())
            .collect()
    }

    fn estimate_item_size(&self, item: &QueueItem) -> u64 {
        self.settings.item_size_base_bytes * u64::from(item.retry_count + 1)
    }

    /// Largest-estimate-first eviction until the total drops under the
    /// size threshold.
    fn candidates_by_size(
        &self,
        state: &crate::archiver::queue::state::QueueState,
        now: DateTime<Utc>,
    ) -> HashSet<String> {
        let mut items: Vec<(&QueueItem, u64)> = state
            .completed
            .values()
            .chain(state.failed.values())
            .map(|item| (item, self.estimate_item_size(item)))
            .collect();
        let mut total: u64 = items.iter().map(|(_, size)| size).sum();
        if total <= self.settings.size_threshold_bytes {
            return HashSet::new();
        }

        items.sort_by_key(|(_, size)| std::cmp::Reverse(*size));
        let mut evict = HashSet::new();
        for (item, size) in items {
            if total <= self.settings.size_threshold_bytes {
                break;
            }
            if self.within_retention(item, now) {
                continue;
            }
            evict.insert(item.url.clone());
            total = total.saturating_sub(size);
        }
        evict
    }

    /// TRACKING phase: reconcile guild/channel indices against the live
    /// pending ∪ processing URL set.
    pub fn tracking_pass(&self, state: &mut crate::archiver::queue::state::QueueState) -> usize {
        let live: HashSet<String> = state
            .pending
            .iter()
            .map(|item| item.url.clone())
            .chain(state.processing.keys().cloned())
            .collect();

        let mut removed = 0usize;
        let aggressiveness = self.settings.aggressiveness;
        let max_invalid_ratio = self.settings.max_invalid_ratio;

        let mut reconcile = |index: &mut std::collections::HashMap<u64, HashSet<String>>| {
            for urls in index.values_mut() {
                let invalid: Vec<String> = urls
                    .iter()
                    .filter(|url| {
                        !live.contains(*url)
                            || (aggressiveness == CleanupAggressiveness::Aggressive
                                && !looks_like_url(url))
                    })
                    .cloned()
                    .collect();

                if aggressiveness == CleanupAggressiveness::Conservative && !urls.is_empty() {
                    let ratio = invalid.len() as f64 / urls.len() as f64;
                    if ratio <= max_invalid_ratio {
                        continue;
                    }
                }

                for url in invalid {
                    urls.remove(&url);
                    removed += 1;
                }
            }
            if self.settings.cleanup_empty_tracking {
                index.retain(|_, urls| !urls.is_empty());
            }
        };

        reconcile(&mut state.guild_index);
        reconcile(&mut state.channel_index);

        if removed > 0 {
            debug!(removed, "tracking cleanup reconciled indices");
        }
        removed
    }

    /// GUILD phase, on demand from `clear(guild_id)`. Works in batches of
    /// `batch_size` URLs per lock acquisition with a cooperative yield in
    /// between, so workers interleave freely during large clears.
    pub fn guild_clear(&self, inner: &Inner, guild_id: u64) -> usize {
        let strategy = self.settings.guild_strategy;
        let grace_cutoff = Utc::now() - ChronoDuration::seconds(self.settings.grace_period_secs);
        let mut cleared = 0usize;

        loop {
            let batch: Vec<String> = {
                let state = inner.state.lock_unpoisoned();
                let eligible = |item: &QueueItem| match strategy {
                    GuildCleanupStrategy::Full => true,
                    // SELECTIVE clears active work but preserves history.
                    GuildCleanupStrategy::Selective => true,
                    GuildCleanupStrategy::Graceful => age_reference(item) < grace_cutoff,
                };

                let mut batch: Vec<String> = Vec::with_capacity(self.settings.batch_size);
                let active = state
                    .pending
                    .iter()
                    .chain(state.processing.values())
                    .filter(|item| item.guild_id == guild_id && eligible(item))
                    .map(|item| item.url.clone());
                let history = state
                    .completed
                    .values()
                    .chain(state.failed.values())
                    .filter(|item| {
                        item.guild_id == guild_id
                            && strategy != GuildCleanupStrategy::Selective
                            && eligible(item)
                    })
                    .map(|item| item.url.clone());
                for url in active.chain(history) {
                    if batch.len() >= self.settings.batch_size {
                        break;
                    }
                    batch.push(url);
                }
                batch
            };

            if batch.is_empty() {
                break;
            }

            {
                let mut state = inner.state.lock_unpoisoned();
                for url in &batch {
                    state.pending.retain(|item| &item.url != url);
                    state.processing.remove(url);
                    state.completed.remove(url);
                    state.failed.remove(url);
                    cleared += 1;
                }
                state.rebuild_indices();
            }
            std::thread::yield_now();
        }

        if cleared > 0 {
            info!(guild_id, cleared, "guild cleanup complete");
        }
        cleared
    }

    /// Whether an emergency pass should run now for the given pending size.
    pub fn should_run_emergency(&self, pending_len: usize) -> bool {
        if pending_len <= self.settings.emergency_pending_threshold {
            return false;
        }
        let now = Utc::now();
        let mut last = self.last_emergency.lock_unpoisoned();
        let allowed = last.is_none_or(|ts| {
            (now - ts).num_seconds() >= self.settings.emergency_min_interval_secs
        });
        if allowed {
            *last = Some(now);
        }
        allowed
    }
}

fn looks_like_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
