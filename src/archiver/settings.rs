use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};

/// Aggregate configuration for the archiving pipeline.
///
/// Loaded from an optional TOML file merged with `ARCHIVER_`-prefixed
/// environment variables; every field carries a serde default so a missing
/// or partial file still yields a working configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverSettings {
    pub queue: QueueSettings,
    pub monitor: MonitorSettings,
    pub recovery: RecoverySettings,
    pub cleaner: CleanerSettings,
    pub persistence: PersistenceSettings,
    pub processor: ProcessorSettings,
    pub tools: ToolSettings,
    pub reactions: ReactionSet,
}

impl ArchiverSettings {
    /// Load settings from `path` (TOML) and the environment. A default file
    /// is written when none exists so operators have something to edit.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let defaults =
                toml::to_string_pretty(&Self::default()).context("failed to render defaults")?;
            fs::write(path, defaults)
                .with_context(|| format!("failed to write default settings to {}", path.display()))?;
        }

        let settings: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ARCHIVER_").split("__"))
            .extract()
            .with_context(|| format!("failed to load settings from {}", path.display()))?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Attempts before an item is conclusively failed.
    pub max_retries: u32,
    /// Pending-size bound; submits beyond it are rejected.
    pub max_queue_size: usize,
    /// Worker pool size. Clamped to 1..=5 at spawn time.
    pub concurrent_downloads: usize,
    /// Periodic snapshot interval while `run` is active, seconds.
    pub persist_interval_secs: u64,
    /// Drain budget for `shutdown` before force cleanup, seconds.
    pub unload_timeout_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_queue_size: 1000,
            concurrent_downloads: 3,
            persist_interval_secs: 60,
            unload_timeout_secs: 30,
        }
    }
}

impl QueueSettings {
    pub const MAX_WORKERS: usize = 5;

    pub fn effective_workers(&self) -> usize {
        self.concurrent_downloads.clamp(1, Self::MAX_WORKERS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub check_interval_secs: u64,
    pub memory_warning_mb: f64,
    pub memory_critical_mb: f64,
    pub success_rate_warning: f64,
    pub success_rate_critical: f64,
    pub inactivity_warning_secs: i64,
    pub inactivity_critical_secs: i64,
    pub deadlock_warning_secs: i64,
    pub deadlock_critical_secs: i64,
    /// Processing age beyond which recovery is triggered, seconds.
    pub deadlock_threshold_secs: i64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub cpu_warning_percent: f32,
    pub cpu_critical_percent: f32,
    /// Active alerts before escalating to intensive monitoring.
    pub alert_threshold: usize,
    /// Sustained quiet period before de-escalating back to normal, seconds.
    pub deescalate_after_secs: i64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            memory_warning_mb: 384.0,
            memory_critical_mb: 512.0,
            success_rate_warning: 0.8,
            success_rate_critical: 0.5,
            inactivity_warning_secs: 30,
            inactivity_critical_secs: 60,
            deadlock_warning_secs: 30,
            deadlock_critical_secs: 60,
            deadlock_threshold_secs: 300,
            error_rate_warning: 0.1,
            error_rate_critical: 0.2,
            cpu_warning_percent: 80.0,
            cpu_critical_percent: 90.0,
            alert_threshold: 5,
            deescalate_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    Aggressive,
    Conservative,
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub policy: RecoveryPolicy,
    /// Processing age that forces emergency recovery, seconds.
    pub emergency_threshold_secs: i64,
    /// Base delay for the requeue exponential backoff, seconds.
    pub backoff_base_secs: u64,
    /// Backoff cap, seconds.
    pub max_backoff_secs: u64,
    pub max_concurrent_recoveries: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            policy: RecoveryPolicy::Balanced,
            emergency_threshold_secs: 600,
            backoff_base_secs: 5,
            max_backoff_secs: 60,
            max_concurrent_recoveries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryPolicy {
    #[default]
    Age,
    Size,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CleanupAggressiveness {
    Aggressive,
    Conservative,
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuildCleanupStrategy {
    #[default]
    Full,
    Selective,
    Graceful,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerSettings {
    pub cleanup_interval_secs: u64,
    /// History entries older than this are eligible for eviction, seconds.
    pub max_history_age_secs: i64,
    /// Entries younger than this are never evicted, seconds.
    pub min_retention_secs: i64,
    pub history_policy: HistoryPolicy,
    pub aggressiveness: CleanupAggressiveness,
    /// Total estimated history size that triggers size-based eviction.
    pub size_threshold_bytes: u64,
    /// Base per-item size estimate; scaled by `retry_count + 1`.
    pub item_size_base_bytes: u64,
    pub cleanup_empty_tracking: bool,
    pub max_invalid_ratio: f64,
    pub guild_strategy: GuildCleanupStrategy,
    /// Grace window for graceful guild clears, seconds.
    pub grace_period_secs: i64,
    pub batch_size: usize,
    /// Pending size that triggers an emergency cleanup pass.
    pub emergency_pending_threshold: usize,
    /// Minimum spacing between emergency passes, seconds.
    pub emergency_min_interval_secs: i64,
}

impl Default for CleanerSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 1800,
            max_history_age_secs: 43_200,
            min_retention_secs: 3600,
            history_policy: HistoryPolicy::Age,
            aggressiveness: CleanupAggressiveness::Balanced,
            size_threshold_bytes: 100 * 1024 * 1024,
            item_size_base_bytes: 1024 * 1024,
            cleanup_empty_tracking: true,
            max_invalid_ratio: 0.5,
            guild_strategy: GuildCleanupStrategy::Full,
            grace_period_secs: 300,
            batch_size: 100,
            emergency_pending_threshold: 10_000,
            emergency_min_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// State file path; `None` disables persistence entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub backup_interval_secs: i64,
    pub max_backups: usize,
    pub write_retries: u32,
    pub write_retry_delay_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            path: None,
            backup_interval_secs: 3600,
            max_backups: 24,
            write_retries: 3,
            write_retry_delay_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Upload size cap; larger artifacts are transcoded down to fit.
    pub max_file_size_mb: u64,
    pub chat_retry_attempts: u32,
    pub chat_retry_delay_secs: u64,
    /// Extractor-name allow-list; empty means every site is allowed.
    pub allowed_sites: Vec<String>,
    pub video_format: String,
    pub max_quality: u32,
    pub download_attempts: u32,
    /// Override for the scratch directory; defaults to the system temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_file_size_mb: 8,
            chat_retry_attempts: 3,
            chat_retry_delay_secs: 5,
            allowed_sites: Vec::new(),
            video_format: "mp4".to_string(),
            max_quality: 1080,
            download_attempts: 5,
            temp_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffprobe_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ytdlp_path: Option<String>,
    /// Fetch static builds into the crate-owned tools directory when a
    /// binary is absent from PATH.
    pub auto_download: bool,
    pub verify_timeout_secs: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            ytdlp_path: None,
            auto_download: true,
            verify_timeout_secs: 10,
        }
    }
}

/// Reaction vocabulary. Presentation only; the pipeline requires just that
/// the glyphs are distinguishable and can be set and cleared atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactionSet {
    pub queued: String,
    pub processing: String,
    pub success: String,
    pub error: String,
    pub archived: String,
    /// Five-step ladder for queue position.
    pub numbers: Vec<String>,
    /// Five-step ladder for work progress.
    pub progress: Vec<String>,
    /// Six-step ladder for download progress.
    pub download: Vec<String>,
}

impl Default for ReactionSet {
    fn default() -> Self {
        Self {
            queued: "📹".to_string(),
            processing: "⚙️".to_string(),
            success: "✅".to_string(),
            error: "❌".to_string(),
            archived: "🔄".to_string(),
            numbers: ["1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣"]
                .map(str::to_string)
                .to_vec(),
            progress: ["⬛", "🟥", "🟧", "🟨", "🟩"].map(str::to_string).to_vec(),
            download: ["0️⃣", "2️⃣", "4️⃣", "6️⃣", "8️⃣", "🔟"]
                .map(str::to_string)
                .to_vec(),
        }
    }
}

impl ReactionSet {
    /// Pick the ladder glyph for a progress fraction in `[0, 1]`.
    pub fn ladder_glyph<'a>(&self, ladder: &'a [String], fraction: f64) -> Option<&'a str> {
        if ladder.is_empty() {
            return None;
        }
        let clamped = fraction.clamp(0.0, 1.0);
        let index = (clamped * (ladder.len() - 1) as f64).round() as usize;
        ladder.get(index).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_thresholds() {
        let settings = ArchiverSettings::default();
        assert_eq!(settings.queue.max_retries, 3);
        assert_eq!(settings.queue.max_queue_size, 1000);
        assert_eq!(settings.queue.effective_workers(), 3);
        assert_eq!(settings.monitor.check_interval_secs, 15);
        assert_eq!(settings.monitor.deadlock_threshold_secs, 300);
        assert_eq!(settings.recovery.emergency_threshold_secs, 600);
        assert_eq!(settings.cleaner.max_history_age_secs, 43_200);
        assert_eq!(settings.persistence.max_backups, 24);
        assert_eq!(settings.processor.download_attempts, 5);
    }

    #[test]
    fn worker_count_is_clamped_to_the_pool_bound() {
        let mut queue = QueueSettings::default();
        queue.concurrent_downloads = 64;
        assert_eq!(queue.effective_workers(), QueueSettings::MAX_WORKERS);
        queue.concurrent_downloads = 0;
        assert_eq!(queue.effective_workers(), 1);
    }

    #[test]
    fn load_writes_a_default_file_and_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("archiver.toml");
        let settings = ArchiverSettings::load(&path).expect("load defaults");
        assert!(path.exists());
        assert_eq!(settings.queue.max_retries, 3);

        // A partial file overrides only the named keys.
        fs::write(&path, "[queue]\nmax_retries = 7\n").unwrap();
        let settings = ArchiverSettings::load(&path).expect("load partial");
        assert_eq!(settings.queue.max_retries, 7);
        assert_eq!(settings.queue.max_queue_size, 1000);
    }

    #[test]
    fn ladder_glyph_maps_fraction_endpoints() {
        let reactions = ReactionSet::default();
        assert_eq!(
            reactions.ladder_glyph(&reactions.download, 0.0),
            Some("0️⃣")
        );
        assert_eq!(
            reactions.ladder_glyph(&reactions.download, 1.0),
            Some("🔟")
        );
        assert_eq!(reactions.ladder_glyph(&reactions.numbers, 0.5), Some("3️⃣"));
    }
}
