use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::archiver::domain::{DownloadProgress, TranscodeProgress};
use crate::sync_ext::MutexExt;

/// In-memory progress maps for active downloads and transcodes, keyed by
/// source URL. Entries flip `active = false` on completion and are reaped
/// by the cleaner on its next pass.
#[derive(Default)]
pub struct ProgressTracker {
    downloads: Mutex<HashMap<String, DownloadProgress>>,
    transcodes: Mutex<HashMap<String, TranscodeProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_download(&self, url: &str, retries: u32) {
        let mut downloads = self.downloads.lock_unpoisoned();
        let entry = downloads.entry(url.to_string()).or_default();
        entry.retries = retries;
        entry.percent = 0.0;
        entry.active = true;
        entry.last_update = Some(Utc::now());
    }

    pub fn update_download(&self, url: &str, progress: &DownloadProgress) {
        let mut downloads = self.downloads.lock_unpoisoned();
        let entry = downloads.entry(url.to_string()).or_default();
        let retries = entry.retries.max(progress.retries);
        *entry = progress.clone();
        entry.retries = retries;
        entry.active = true;
        entry.last_update = Some(Utc::now());
    }

    pub fn finish_download(&self, url: &str) {
        if let Some(entry) = self.downloads.lock_unpoisoned().get_mut(url) {
            entry.percent = 100.0;
            entry.active = false;
            entry.last_update = Some(Utc::now());
        }
    }

    pub fn download_snapshot(&self, url: &str) -> Option<DownloadProgress> {
        self.downloads.lock_unpoisoned().get(url).cloned()
    }

    pub fn update_transcode(&self, url: &str, progress: TranscodeProgress) {
        let mut transcodes = self.transcodes.lock_unpoisoned();
        transcodes.insert(url.to_string(), progress);
    }

    pub fn finish_transcode(&self, url: &str) {
        if let Some(entry) = self.transcodes.lock_unpoisoned().get_mut(url) {
            entry.percent = 100.0;
            entry.active = false;
            entry.last_update = Some(Utc::now());
        }
    }

    pub fn transcode_snapshot(&self, url: &str) -> Option<TranscodeProgress> {
        self.transcodes.lock_unpoisoned().get(url).cloned()
    }

    /// Drop inactive entries; called by the cleaner.
    pub fn remove_inactive(&self) -> usize {
        let mut removed = 0;
        {
            let mut downloads = self.downloads.lock_unpoisoned();
            let before = downloads.len();
            downloads.retain(|_, entry| entry.active);
            removed += before - downloads.len();
        }
        {
            let mut transcodes = self.transcodes.lock_unpoisoned();
            let before = transcodes.len();
            transcodes.retain(|_, entry| entry.active);
            removed += before - transcodes.len();
        }
        removed
    }

    pub fn active_counts(&self) -> (usize, usize) {
        (
            self.downloads
                .lock_unpoisoned()
                .values()
                .filter(|e| e.active)
                .count(),
            self.transcodes
                .lock_unpoisoned()
                .values()
                .filter(|e| e.active)
                .count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_lifecycle_updates_and_reaps() {
        let tracker = ProgressTracker::new();
        tracker.start_download("u1", 0);
        assert!(tracker.download_snapshot("u1").unwrap().active);

        let mut progress = DownloadProgress::default();
        progress.percent = 55.0;
        tracker.update_download("u1", &progress);
        assert_eq!(tracker.download_snapshot("u1").unwrap().percent, 55.0);

        tracker.finish_download("u1");
        let snapshot = tracker.download_snapshot("u1").unwrap();
        assert!(!snapshot.active);
        assert_eq!(snapshot.percent, 100.0);

        assert_eq!(tracker.remove_inactive(), 1);
        assert!(tracker.download_snapshot("u1").is_none());
    }

    #[test]
    fn retries_survive_progress_overwrites() {
        let tracker = ProgressTracker::new();
        tracker.start_download("u1", 2);
        tracker.update_download("u1", &DownloadProgress::default());
        assert_eq!(tracker.download_snapshot("u1").unwrap().retries, 2);
    }

    #[test]
    fn active_counts_track_both_maps() {
        let tracker = ProgressTracker::new();
        tracker.start_download("u1", 0);
        tracker.update_transcode(
            "u1",
            TranscodeProgress {
                active: true,
                ..TranscodeProgress::default()
            },
        );
        assert_eq!(tracker.active_counts(), (1, 1));
        tracker.finish_download("u1");
        tracker.finish_transcode("u1");
        assert_eq!(tracker.active_counts(), (0, 0));
    }
}
