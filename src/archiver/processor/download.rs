use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::archiver::adapters::VideoDownloader;
use crate::archiver::domain::DownloadProgress;
use crate::archiver::error::ArchiveError;
use crate::archiver::settings::ProcessorSettings;
use crate::archiver::shutdown::ShutdownSignal;

/// Backoff before retry `k` (zero-based): `10·2^k + 2k` seconds.
pub fn attempt_backoff(k: u32) -> Duration {
    Duration::from_secs(10u64 << k.min(16)) + Duration::from_secs(2 * u64::from(k))
}

/// Retry-and-verify wrapper around a [`VideoDownloader`].
///
/// Each attempt probes first (a simulated extraction that moves no media
/// bytes), enforces the site allow-list against the extractor name, then
/// downloads and verifies. A file that exists but fails verification counts
/// as an attempt failure. The backoff between attempts is cancellable.
pub struct DownloadManager {
    attempts: u32,
    allowed_sites: Vec<String>,
    shutdown: Arc<ShutdownSignal>,
}

impl DownloadManager {
    pub fn new(settings: &ProcessorSettings, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            attempts: settings.download_attempts.max(1),
            allowed_sites: settings
                .allowed_sites
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            shutdown,
        }
    }

    fn site_allowed(&self, extractor: &str) -> bool {
        if self.allowed_sites.is_empty() {
            return true;
        }
        let extractor = extractor.to_ascii_lowercase();
        self.allowed_sites
            .iter()
            .any(|site| extractor.contains(site))
    }

    pub fn download(
        &self,
        downloader: &dyn VideoDownloader,
        url: &str,
        dest: &Path,
        verify: &dyn Fn(&Path) -> Result<()>,
        progress: &mut dyn FnMut(&DownloadProgress),
    ) -> Result<PathBuf, ArchiveError> {
        let mut last_error = String::new();

        for attempt in 0..self.attempts {
            if self.shutdown.is_triggered() {
                return Err(ArchiveError::Shutdown);
            }
            if attempt > 0 {
                let delay = attempt_backoff(attempt - 1);
                debug!(url, attempt, delay_secs = delay.as_secs(), "backing off before retry");
                if self.shutdown.wait_timeout(delay) {
                    return Err(ArchiveError::Shutdown);
                }
            }

            // Probe before moving bytes; an unsupported site is permanent
            // and skips the remaining attempts.
            let probe = match downloader.probe(url) {
                Ok(probe) => probe,
                Err(err) => {
                    let text = format!("{err:#}");
                    if text.contains("unsupported url") {
                        return Err(ArchiveError::UnsupportedUrl(url.to_string()));
                    }
                    warn!(url, attempt, error = %text, "probe failed");
                    last_error = text;
                    continue;
                }
            };
            if !self.site_allowed(&probe.extractor) {
                return Err(ArchiveError::UnsupportedUrl(format!(
                    "site '{}' is not on the allow-list",
                    probe.extractor
                )));
            }

            let mut report = |p: &DownloadProgress| {
                let mut enriched = p.clone();
                enriched.retries = attempt;
                enriched.title = enriched.title.take().or_else(|| probe.title.clone());
                enriched.extractor = Some(probe.extractor.clone());
                progress(&enriched);
            };

            let path = match downloader.download(url, dest, &mut report) {
                Ok(path) => path,
                Err(err) => {
                    if self.shutdown.is_triggered() {
                        return Err(ArchiveError::Shutdown);
                    }
                    last_error = format!("{err:#}");
                    warn!(url, attempt, error = %last_error, "download attempt failed");
                    continue;
                }
            };

            match verify(&path) {
                Ok(()) => {
                    info!(url, attempt, path = %path.display(), "download verified");
                    return Ok(path);
                }
                Err(err) => {
                    last_error = format!("downloaded file failed verification: {err:#}");
                    warn!(url, attempt, error = %last_error, "verification failed");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        Err(ArchiveError::DownloadFailed(format!(
            "all {} attempts failed: {last_error}",
            self.attempts
        )))
    }
}

/// Overwrite a file with zeros before unlinking it, so replaced originals
/// do not linger in free blocks.
pub fn secure_delete(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {} for secure delete", path.display()))?;
    let len = metadata.len();

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {} for overwrite", path.display()))?;
    let zeros = vec![0u8; 64 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..chunk])
            .with_context(|| format!("failed to overwrite {}", path.display()))?;
        remaining -= chunk as u64;
    }
    file.sync_all().ok();
    drop(file);

    std::fs::remove_file(path)
        .with_context(|| format!("failed to remove {}", path.display()))
}
