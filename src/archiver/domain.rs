use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Rolling window length for per-queue processing time statistics.
pub const PROCESSING_TIME_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Coerce `processing_time` from historical snapshots where it may have been
/// written as a string or an integer. Unparseable values fall back to 0.0.
fn lenient_f64<'de, D>(de: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Raw::deserialize(de)? {
        Raw::Num(v) if v.is_finite() => v,
        Raw::Num(_) => 0.0,
        Raw::Text(s) => s.trim().parse().unwrap_or(0.0),
        Raw::Other(_) => 0.0,
    })
}

/// The unit of work: one submitted URL and the origin message it came from.
///
/// Items are created on submit, mutated only by the owning worker while in
/// `processing`, and moved between collections by the queue manager. The
/// serde form is the on-disk snapshot format: snake_case keys, ISO-8601 UTC
/// instants, unknown fields ignored on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub url: String,
    pub message_id: u64,
    pub channel_id: u64,
    pub guild_id: u64,
    pub author_id: u64,
    pub added_at: DateTime<Utc>,
    /// Higher runs first; ties broken by `added_at`. Clamped to 0..=10.
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_status")]
    pub status: ItemStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Wall seconds of the most recent attempt. Loaders must tolerate
    /// string/int encodings from older snapshots.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub processing_time: f64,
    #[serde(default)]
    pub processing_times: Vec<f64>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hardware_accel_attempted: bool,
    #[serde(default)]
    pub compression_attempted: bool,
}

fn default_status() -> ItemStatus {
    ItemStatus::Pending
}

impl QueueItem {
    pub fn new(
        url: impl Into<String>,
        message_id: u64,
        channel_id: u64,
        guild_id: u64,
        author_id: u64,
        priority: u8,
    ) -> Self {
        Self {
            url: url.into(),
            message_id,
            channel_id,
            guild_id,
            author_id,
            added_at: Utc::now(),
            priority: priority.min(10),
            status: ItemStatus::Pending,
            error: None,
            retry_count: 0,
            last_retry: None,
            start_time: None,
            processing_time: 0.0,
            processing_times: Vec::new(),
            size_bytes: 0,
            last_error: None,
            last_error_time: None,
            hardware_accel_attempted: false,
            compression_attempted: false,
        }
    }

    /// Sort key for the pending sequence: `(−priority, added_at)`.
    pub fn schedule_key(&self) -> (std::cmp::Reverse<u8>, DateTime<Utc>) {
        (std::cmp::Reverse(self.priority), self.added_at)
    }

    /// Mark the item as claimed by a worker.
    pub fn start_processing(&mut self) {
        self.status = ItemStatus::Processing;
        self.start_time = Some(Utc::now());
    }

    /// Record the outcome of one attempt. Does not decide retry-vs-fail;
    /// that is the queue manager's call.
    pub fn finish_attempt(&mut self, ok: bool, error: Option<&str>) {
        if let Some(start) = self.start_time.take() {
            let elapsed = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
            self.processing_time = elapsed.max(0.0);
            self.processing_times.push(self.processing_time);
            if self.processing_times.len() > PROCESSING_TIME_WINDOW {
                self.processing_times.remove(0);
            }
        }
        if ok {
            self.status = ItemStatus::Completed;
            self.error = None;
        } else {
            self.error = error.map(str::to_string);
            self.last_error = self.error.clone();
            self.last_error_time = Some(Utc::now());
        }
    }
}

/// Aggregate queue metrics. `update` is called once per terminal handler
/// call, so `total_processed` counts attempts, not distinct items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub total_failed: u64,
    #[serde(default)]
    pub avg_processing_time: f64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub errors_by_type: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compression_failures: u64,
    #[serde(default)]
    pub hardware_accel_failures: u64,
    #[serde(skip)]
    pub processing_times: Vec<f64>,
    #[serde(skip)]
    pub peak_memory_usage: f64,
    #[serde(skip)]
    pub last_activity: Option<DateTime<Utc>>,
}

impl QueueMetrics {
    pub fn update(&mut self, processing_time: f64, success: bool, error: Option<&str>) {
        self.total_processed += 1;
        if !success {
            self.total_failed += 1;
            if let Some(error) = error {
                self.last_error = Some(error.to_string());
                self.last_error_time = Some(Utc::now());
                let kind = error.split(':').next().unwrap_or(error).trim();
                *self.errors_by_type.entry(kind.to_string()).or_insert(0) += 1;

                let lower = error.to_ascii_lowercase();
                if lower.contains("compressionerror") || lower.contains("compression error") {
                    self.compression_failures += 1;
                } else if lower.contains("hardwareaccelfailed")
                    || lower.contains("hardware acceleration failed")
                {
                    self.hardware_accel_failures += 1;
                }
            }
        }

        self.processing_times.push(processing_time);
        if self.processing_times.len() > PROCESSING_TIME_WINDOW {
            self.processing_times.remove(0);
        }
        self.avg_processing_time = if self.processing_times.is_empty() {
            0.0
        } else {
            self.processing_times.iter().sum::<f64>() / self.processing_times.len() as f64
        };

        self.success_rate = if self.total_processed > 0 {
            (self.total_processed - self.total_failed) as f64 / self.total_processed as f64
        } else {
            0.0
        };
    }

    pub fn touch_activity(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    pub fn record_memory_sample(&mut self, rss_mb: f64) {
        if rss_mb > self.peak_memory_usage {
            self.peak_memory_usage = rss_mb;
        }
    }
}

/// Per-guild counts plus a metrics snapshot, as returned by
/// `QueueManager::status`.
#[derive(Debug, Clone, Serialize)]
pub struct GuildQueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub metrics: QueueMetrics,
}

/// Durable mapping from a submitted URL to the location of its archived
/// copy. At most one record exists per `source_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub source_url: String,
    pub archive_url: String,
    pub archive_message_id: u64,
    pub archive_channel_id: u64,
    pub guild_id: u64,
    pub archived_at: DateTime<Utc>,
}

/// In-memory download progress for one active URL.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadProgress {
    pub percent: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub retries: u32,
    pub title: Option<String>,
    pub extractor: Option<String>,
    pub format: Option<String>,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    pub active: bool,
}

/// In-memory transcode progress for one active output file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscodeProgress {
    pub filename: String,
    pub percent: f64,
    pub elapsed: f64,
    pub input_size: u64,
    pub current_size: u64,
    pub target_size: u64,
    pub codec: String,
    pub hardware_accel: bool,
    pub preset: String,
    pub crf: Option<u8>,
    pub duration: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(url: &str) -> QueueItem {
        QueueItem::new(url, 1, 2, 3, 4, 0)
    }

    #[test]
    fn processing_time_coerces_from_string_int_and_garbage() {
        for (raw, expected) in [
            (json!("12.5"), 12.5),
            (json!(7), 7.0),
            (json!(3.25), 3.25),
            (json!("not a number"), 0.0),
            (json!(null), 0.0),
            (json!({"weird": true}), 0.0),
        ] {
            let value = json!({
                "url": "https://example.com/v",
                "message_id": 1,
                "channel_id": 2,
                "guild_id": 3,
                "author_id": 4,
                "added_at": "2024-01-01T00:00:00Z",
                "processing_time": raw,
            });
            let decoded: QueueItem = serde_json::from_value(value).expect("deserialize item");
            assert_eq!(decoded.processing_time, expected);
        }
    }

    #[test]
    fn unknown_fields_are_ignored_and_optionals_default() {
        let value = json!({
            "url": "https://example.com/v",
            "message_id": 1,
            "channel_id": 2,
            "guild_id": 3,
            "author_id": 4,
            "added_at": "2024-01-01T00:00:00Z",
            "some_future_field": {"nested": [1, 2, 3]},
        });
        let decoded: QueueItem = serde_json::from_value(value).expect("deserialize item");
        assert_eq!(decoded.status, ItemStatus::Pending);
        assert_eq!(decoded.retry_count, 0);
        assert!(decoded.start_time.is_none());
    }

    #[test]
    fn schedule_key_orders_high_priority_then_fifo() {
        let mut a = item("a");
        a.priority = 0;
        let mut b = item("b");
        b.priority = 5;
        let mut c = item("c");
        c.priority = 0;
        c.added_at = a.added_at + chrono::Duration::seconds(1);

        let mut items = vec![c.clone(), a.clone(), b.clone()];
        items.sort_by_key(QueueItem::schedule_key);
        let order: Vec<&str> = items.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(order, ["b", "a", "c"]);
    }

    #[test]
    fn metrics_update_counts_attempts_and_buckets_error_kinds() {
        let mut metrics = QueueMetrics::default();
        metrics.update(1.0, true, None);
        metrics.update(2.0, false, Some("DownloadFailed: connection reset"));
        metrics.update(3.0, false, Some("DownloadFailed: 403"));
        metrics.update(4.0, false, Some("CompressionError: encoder died"));

        assert_eq!(metrics.total_processed, 4);
        assert_eq!(metrics.total_failed, 3);
        assert_eq!(metrics.errors_by_type.get("DownloadFailed"), Some(&2));
        assert_eq!(metrics.errors_by_type.get("CompressionError"), Some(&1));
        assert_eq!(metrics.compression_failures, 1);
        assert!((metrics.success_rate - 0.25).abs() < 1e-9);
        assert!((metrics.avg_processing_time - 2.5).abs() < 1e-9);
    }

    #[test]
    fn metrics_processing_times_keep_a_bounded_window() {
        let mut metrics = QueueMetrics::default();
        for i in 0..(PROCESSING_TIME_WINDOW + 20) {
            metrics.update(i as f64, true, None);
        }
        assert_eq!(metrics.processing_times.len(), PROCESSING_TIME_WINDOW);
        // Oldest entries are evicted first.
        assert_eq!(metrics.processing_times[0], 20.0);
    }

    #[test]
    fn finish_attempt_records_error_trail() {
        let mut item = item("https://example.com/v");
        item.start_processing();
        assert_eq!(item.status, ItemStatus::Processing);
        assert!(item.start_time.is_some());

        item.finish_attempt(false, Some("DownloadFailed: timed out"));
        assert!(item.start_time.is_none());
        assert_eq!(item.last_error.as_deref(), Some("DownloadFailed: timed out"));
        assert!(item.last_error_time.is_some());
        assert_eq!(item.processing_times.len(), 1);
    }
}
