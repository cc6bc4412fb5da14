use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::archiver::domain::{QueueItem, QueueMetrics};
use crate::archiver::queue::state::QueueState;
use crate::archiver::settings::PersistenceSettings;
use crate::sync_ext::MutexExt;

pub const STATE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATE_VERSION
}

/// On-disk snapshot document. Field names and shapes are the stable wire
/// format; unknown fields are ignored on load and missing ones default.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub queue: Vec<QueueItem>,
    #[serde(default)]
    pub processing: HashMap<String, QueueItem>,
    #[serde(default)]
    pub completed: HashMap<String, QueueItem>,
    #[serde(default)]
    pub failed: HashMap<String, QueueItem>,
    #[serde(default)]
    pub metrics: QueueMetrics,
}

impl PersistedState {
    pub fn from_queue_state(state: &QueueState) -> Self {
        Self {
            version: STATE_VERSION,
            timestamp: Utc::now(),
            queue: state.pending.clone(),
            processing: state.processing.clone(),
            completed: state.completed.clone(),
            failed: state.failed.clone(),
            metrics: state.metrics.clone(),
        }
    }

    /// Rehydrate a queue state. Indices are always rebuilt from the loaded
    /// collections; persisted index data is never trusted.
    pub fn into_queue_state(self) -> QueueState {
        let mut state = QueueState::new();
        state.pending = self.queue;
        state.processing = self.processing;
        state.completed = self.completed;
        state.failed = self.failed;
        state.metrics = self.metrics;
        state.repair_invariants();
        state
    }
}

/// Parse a snapshot document leniently: items that fail to convert are
/// skipped with a log line instead of poisoning the whole load.
fn parse_state_document(bytes: &[u8]) -> Result<PersistedState> {
    let doc: Value = serde_json::from_slice(bytes).context("snapshot is not valid JSON")?;
    let timestamp = doc
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now);
    let version = doc
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(u64::from(STATE_VERSION)) as u32;

    let convert_item = |value: &Value| -> Option<QueueItem> {
        match serde_json::from_value::<QueueItem>(value.clone()) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(error = %err, "skipping unparseable queue item in snapshot");
                None
            }
        }
    };

    let queue: Vec<QueueItem> = doc
        .get("queue")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(convert_item).collect())
        .unwrap_or_default();

    let convert_map = |key: &str| -> HashMap<String, QueueItem> {
        doc.get(key)
            .and_then(Value::as_object)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(url, value)| convert_item(value).map(|i| (url.clone(), i)))
                    .collect()
            })
            .unwrap_or_default()
    };

    let metrics = doc
        .get("metrics")
        .and_then(|value| serde_json::from_value::<QueueMetrics>(value.clone()).ok())
        .unwrap_or_default();

    Ok(PersistedState {
        version,
        timestamp,
        queue,
        processing: convert_map("processing"),
        completed: convert_map("completed"),
        failed: convert_map("failed"),
        metrics,
    })
}

/// Snapshot writer/loader for the queue state file.
///
/// Writes are atomic (`.tmp` + fsync + rename) under an advisory lock on
/// `<path>.lock`; timed backups land next to the primary as
/// `<path>.bak.YYYYMMDD_HHMMSS` and are pruned to `max_backups`. A primary
/// that fails to parse is quarantined to `<path>.corrupted.<unix>` and the
/// newest readable backup takes over.
pub struct QueuePersistence {
    path: PathBuf,
    lock_path: PathBuf,
    settings: PersistenceSettings,
    last_backup: Mutex<Option<DateTime<Utc>>>,
}

impl QueuePersistence {
    pub fn new(path: PathBuf, settings: PersistenceSettings) -> Self {
        let lock_path = sibling_with_suffix(&path, "lock");
        Self {
            path,
            lock_path,
            settings,
            last_backup: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_file_lock<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let lock_file = fs::File::create(&self.lock_path)
            .with_context(|| format!("failed to open lock file {}", self.lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .context("failed to acquire state file lock")?;
        let result = f();
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    /// Write a snapshot of `state`. Convenience over [`Self::write`] for
    /// callers that already hold no other lock.
    pub fn snapshot(&self, state: &QueueState) -> Result<()> {
        self.write(&PersistedState::from_queue_state(state))
    }

    /// Write a pre-built snapshot document. The caller clones queue state
    /// into the document under the queue lock and releases it before this
    /// runs, so the advisory file lock is never held together with the
    /// queue lock. Retries transient write errors a few times before giving
    /// up; callers log and move on, the next tick will try again.
    pub fn write(&self, document: &PersistedState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document).context("failed to encode snapshot")?;

        self.with_file_lock(|| {
            let mut last_error = None;
            for attempt in 0..self.settings.write_retries.max(1) {
                if attempt > 0 {
                    std::thread::sleep(Duration::from_secs(self.settings.write_retry_delay_secs));
                }
                match self.write_once(&bytes) {
                    Ok(()) => {
                        self.maybe_backup();
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(attempt, error = %format!("{err:#}"), "snapshot write failed");
                        last_error = Some(err);
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| anyhow::anyhow!("snapshot write failed")))
        })
    }

    fn write_once(&self, bytes: &[u8]) -> Result<()> {
        let tmp_path = sibling_with_suffix(&self.path, "tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(bytes)
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            file.flush().context("failed to flush snapshot")?;
            file.sync_all().context("failed to fsync snapshot")?;
        }
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    fn maybe_backup(&self) {
        let now = Utc::now();
        let mut last_backup = self.last_backup.lock_unpoisoned();
        let due = last_backup.is_none_or(|last| {
            (now - last).num_seconds() >= self.settings.backup_interval_secs
        });
        if !due {
            return;
        }
        *last_backup = Some(now);
        drop(last_backup);

        let backup_path = sibling_with_suffix(
            &self.path,
            &format!("bak.{}", now.format("%Y%m%d_%H%M%S")),
        );
        if let Err(err) = fs::copy(&self.path, &backup_path) {
            error!(error = %err, "failed to create state backup");
            return;
        }
        self.prune_backups();
    }

    fn backup_paths(&self) -> Vec<PathBuf> {
        let Some(parent) = self.path.parent() else {
            return Vec::new();
        };
        let prefix = format!(
            "{}.bak.",
            self.path.file_name().unwrap_or_default().to_string_lossy()
        );
        let mut backups: Vec<PathBuf> = fs::read_dir(parent)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with(&prefix))
            })
            .collect();
        // Timestamp suffixes sort lexically in chronological order.
        backups.sort();
        backups
    }

    fn prune_backups(&self) {
        let mut backups = self.backup_paths();
        while backups.len() > self.settings.max_backups {
            let oldest = backups.remove(0);
            if let Err(err) = fs::remove_file(&oldest) {
                warn!(path = %oldest.display(), error = %err, "failed to prune old backup");
            }
        }
    }

    /// Load the most recent readable state. `Ok(None)` when nothing has
    /// ever been persisted.
    pub fn load(&self) -> Result<Option<QueueState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        self.with_file_lock(|| {
            let primary = fs::read(&self.path)
                .with_context(|| format!("failed to read {}", self.path.display()));
            let parse_result = primary.and_then(|bytes| parse_state_document(&bytes));

            let document = match parse_result {
                Ok(document) => document,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "primary state file unreadable");
                    self.quarantine_primary();
                    match self.load_newest_backup() {
                        Some(document) => document,
                        None => bail!("state file corrupted and no readable backup exists"),
                    }
                }
            };

            info!(
                pending = document.queue.len(),
                processing = document.processing.len(),
                "loaded persisted queue state"
            );
            Ok(Some(document.into_queue_state()))
        })
    }

    fn quarantine_primary(&self) {
        let corrupted = sibling_with_suffix(
            &self.path,
            &format!("corrupted.{}", Utc::now().timestamp()),
        );
        match fs::rename(&self.path, &corrupted) {
            Ok(()) => info!(path = %corrupted.display(), "quarantined corrupted state file"),
            Err(err) => error!(error = %err, "failed to quarantine corrupted state file"),
        }
    }

    fn load_newest_backup(&self) -> Option<PersistedState> {
        for backup in self.backup_paths().into_iter().rev() {
            match fs::read(&backup).map_err(anyhow::Error::from).and_then(|b| parse_state_document(&b)) {
                Ok(document) => {
                    info!(path = %backup.display(), "recovered state from backup");
                    return Some(document);
                }
                Err(err) => {
                    warn!(path = %backup.display(), error = %format!("{err:#}"), "backup unreadable");
                }
            }
        }
        None
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!("{name}.{suffix}"))
}
