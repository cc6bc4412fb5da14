//! Per-item pipeline: idempotency short-circuit, download, size policy,
//! transcode, upload, index, with reaction transitions on the origin
//! message and scoped cleanup of scratch files on every exit path.

pub mod download;
pub mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::archiver::adapters::{ChatAdapter, GuildRegistry, SentFile};
use crate::archiver::archive_index::ArchiveIndex;
use crate::archiver::domain::{ArchiveRecord, QueueItem, TranscodeProgress};
use crate::archiver::error::ArchiveError;
use crate::archiver::ffmpeg::FfmpegManager;
use crate::archiver::queue::{ItemHandler, MetricsSink};
use crate::archiver::settings::{ProcessorSettings, ReactionSet};
use crate::archiver::shutdown::ShutdownSignal;
use download::{DownloadManager, secure_delete};
use progress::ProgressTracker;

type CancelCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type ArtifactVerifier = Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

/// The worker-side item handler. One instance serves the whole pool; all
/// state is per-call or behind the shared trackers.
pub struct Processor {
    chat: Arc<dyn ChatAdapter>,
    guilds: Arc<GuildRegistry>,
    index: Arc<ArchiveIndex>,
    ffmpeg: Arc<FfmpegManager>,
    progress: Arc<ProgressTracker>,
    downloads: DownloadManager,
    settings: ProcessorSettings,
    reactions: ReactionSet,
    metrics: MetricsSink,
    cancel_check: CancelCheck,
    verify_artifact: ArtifactVerifier,
    shutdown: Arc<ShutdownSignal>,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatAdapter>,
        guilds: Arc<GuildRegistry>,
        index: Arc<ArchiveIndex>,
        ffmpeg: Arc<FfmpegManager>,
        settings: ProcessorSettings,
        reactions: ReactionSet,
        metrics: MetricsSink,
        cancel_check: CancelCheck,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        let downloads = DownloadManager::new(&settings, shutdown.clone());
        let verifier_ffmpeg = ffmpeg.clone();
        Self {
            chat,
            guilds,
            index,
            ffmpeg,
            progress: Arc::new(ProgressTracker::new()),
            downloads,
            settings,
            reactions,
            metrics,
            cancel_check,
            verify_artifact: Arc::new(move |path| verifier_ffmpeg.verify(path)),
            shutdown,
        }
    }

    /// Replace the downloaded-artifact verifier. The default runs the
    /// ffprobe verification; hosts may layer extra checks on top.
    pub fn with_artifact_verifier(mut self, verifier: ArtifactVerifier) -> Self {
        self.verify_artifact = verifier;
        self
    }

    /// Shared progress maps, for the status surface and the cleaner.
    pub fn progress_tracker(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    fn check_cancelled(&self, url: &str) -> Result<(), ArchiveError> {
        if self.shutdown.is_triggered() || (self.cancel_check)(url) {
            Err(ArchiveError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Best-effort reaction swap on the origin message.
    fn set_reactions(&self, item: &QueueItem, add: &[&str], remove: &[&str]) {
        let add: Vec<String> = add.iter().map(|s| s.to_string()).collect();
        let remove: Vec<String> = remove.iter().map(|s| s.to_string()).collect();
        if let Err(err) =
            self.chat
                .edit_reactions(item.channel_id, item.message_id, &add, &remove)
        {
            debug!(url = %item.url, error = %format!("{err:#}"), "reaction update failed");
        }
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir, ArchiveError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("videoarchiver-");
        let result = match &self.settings.temp_dir {
            Some(base) => {
                std::fs::create_dir_all(base).ok();
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        };
        result.map_err(|err| {
            ArchiveError::DownloadFailed(format!("failed to create scratch directory: {err}"))
        })
    }

    fn max_file_size_bytes(&self) -> u64 {
        self.settings.max_file_size_mb * 1024 * 1024
    }

    /// The full archive pipeline for one attempt. Every early return
    /// unwinds through the scoped temp directory, so partial downloads
    /// never outlive the attempt.
    fn process(&self, item: &mut QueueItem) -> Result<(), ArchiveError> {
        // Idempotency short-circuit: a URL that is already archived is
        // answered from the index without touching any tool.
        match self.index.get(&item.url) {
            Ok(Some(record)) => {
                info!(url = %item.url, "already archived, short-circuiting");
                self.set_reactions(
                    item,
                    &[self.reactions.archived.as_str()],
                    &[
                        self.reactions.queued.as_str(),
                        self.reactions.processing.as_str(),
                    ],
                );
                let note = format!(
                    "This video was already archived. You can find it here: {}",
                    record.archive_url
                );
                if let Err(err) = self.chat.reply(item.channel_id, item.message_id, &note) {
                    warn!(url = %item.url, error = %format!("{err:#}"), "archive reply failed");
                }
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => {
                // A broken index must not block archiving; the worst case
                // is a duplicate upload deduplicated at the final put.
                warn!(url = %item.url, error = %format!("{err:#}"), "archive index lookup failed");
            }
        }

        let components = self
            .guilds
            .get(item.guild_id)
            .ok_or_else(|| ArchiveError::ConfigMissing(format!("guild {}", item.guild_id)))?;

        self.set_reactions(
            item,
            &[self.reactions.processing.as_str()],
            &[self.reactions.queued.as_str()],
        );
        self.progress.start_download(&item.url, item.retry_count);
        self.check_cancelled(&item.url)?;

        let scratch = self.scratch_dir()?;
        let downloaded = self.run_download(item, &*components.downloader, scratch.path())?;
        item.size_bytes = std::fs::metadata(&downloaded).map(|m| m.len()).unwrap_or(0);
        self.progress.finish_download(&item.url);
        self.check_cancelled(&item.url)?;

        let upload_path = self.apply_size_policy(item, &downloaded)?;
        self.check_cancelled(&item.url)?;

        let origin = self
            .chat
            .fetch_message(item.channel_id, item.message_id)
            .ok()
            .flatten();
        let content = components.format_archive_message(origin.as_ref(), &item.url);
        let sent = self.upload_with_retries(components.archive_channel_id, &content, &upload_path)?;

        let record = ArchiveRecord {
            source_url: item.url.clone(),
            archive_url: sent.attachment_url,
            archive_message_id: sent.message_id,
            archive_channel_id: components.archive_channel_id,
            guild_id: item.guild_id,
            archived_at: Utc::now(),
        };
        self.index
            .put(&record)
            .map_err(|err| ArchiveError::IndexError(format!("{err:#}")))?;

        self.set_reactions(
            item,
            &[self.reactions.success.as_str()],
            &[self.reactions.processing.as_str()],
        );
        self.progress.finish_transcode(&item.url);
        info!(url = %item.url, archive_url = %record.archive_url, "item archived");
        Ok(())
    }

    fn run_download(
        &self,
        item: &QueueItem,
        downloader: &dyn crate::archiver::adapters::VideoDownloader,
        scratch: &Path,
    ) -> Result<PathBuf, ArchiveError> {
        let url = item.url.clone();
        let ladder = self.reactions.download.clone();
        let mut last_glyph: Option<String> = None;
        let tracker = self.progress.clone();
        let chat = self.chat.clone();
        let reactions = self.reactions.clone();
        let channel_id = item.channel_id;
        let message_id = item.message_id;

        let mut on_progress = move |p: &crate::archiver::domain::DownloadProgress| {
            tracker.update_download(&url, p);
            // Reaction ladders are coarse on purpose: one chat call per
            // glyph change, not per progress line.
            if let Some(glyph) = reactions.ladder_glyph(&ladder, p.percent / 100.0) {
                if last_glyph.as_deref() != Some(glyph) {
                    let remove: Vec<String> =
                        last_glyph.iter().map(|g: &String| g.to_string()).collect();
                    let add = vec![glyph.to_string()];
                    if let Err(err) = chat.edit_reactions(channel_id, message_id, &add, &remove) {
                        debug!(error = %format!("{err:#}"), "ladder reaction update failed");
                    }
                    last_glyph = Some(glyph.to_string());
                }
            }
        };

        let verify = |path: &Path| (self.verify_artifact)(path);
        self.downloads
            .download(downloader, &item.url, scratch, &verify, &mut on_progress)
    }

    /// Enforce the upload size cap: small files pass through, larger ones
    /// are transcoded to `compressed_<name>` and the original is securely
    /// deleted once the compressed rendition fits.
    fn apply_size_policy(
        &self,
        item: &mut QueueItem,
        downloaded: &Path,
    ) -> Result<PathBuf, ArchiveError> {
        let max_bytes = self.max_file_size_bytes();
        let size = std::fs::metadata(downloaded).map(|m| m.len()).unwrap_or(0);
        if size <= max_bytes {
            return Ok(downloaded.to_path_buf());
        }

        info!(
            url = %item.url,
            size_mb = size / (1024 * 1024),
            cap_mb = self.settings.max_file_size_mb,
            "file exceeds the size cap, transcoding"
        );
        item.compression_attempted = true;
        item.hardware_accel_attempted = self.ffmpeg.gpu().best().is_some();

        let output = crate::archiver::ffmpeg::compressed_output_path(downloaded);
        let url = item.url.clone();
        let tracker = self.progress.clone();
        let input_size = size;
        let target_size = max_bytes;
        let filename = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut on_progress = move |percent: f64, plan: &crate::archiver::ffmpeg::EncodePlan| {
            tracker.update_transcode(
                &url,
                TranscodeProgress {
                    filename: filename.clone(),
                    percent,
                    elapsed: 0.0,
                    input_size,
                    current_size: 0,
                    target_size,
                    codec: plan.codec.clone(),
                    hardware_accel: plan.hardware.is_some(),
                    preset: plan.preset.clone(),
                    crf: Some(plan.crf),
                    duration: 0.0,
                    last_update: Some(Utc::now()),
                    active: true,
                },
            );
        };

        let hw_failed = self
            .ffmpeg
            .transcode(downloaded, &output, max_bytes, &mut on_progress)
            .map_err(|err| {
                self.metrics.record_compression_failure();
                ArchiveError::CompressionError(format!("{err:#}"))
            })?;
        if hw_failed {
            self.metrics.record_hardware_accel_failure();
        }

        let compressed_size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
        if compressed_size == 0 || compressed_size > max_bytes {
            self.metrics.record_compression_failure();
            return Err(ArchiveError::CompressionError(format!(
                "compressed rendition is {compressed_size} bytes against a cap of {max_bytes}"
            )));
        }

        if let Err(err) = secure_delete(downloaded) {
            warn!(path = %downloaded.display(), error = %format!("{err:#}"), "secure delete failed");
        }
        Ok(output)
    }

    fn upload_with_retries(
        &self,
        channel_id: u64,
        content: &str,
        path: &Path,
    ) -> Result<SentFile, ArchiveError> {
        let attempts = self.settings.chat_retry_attempts.max(1);
        let delay = Duration::from_secs(self.settings.chat_retry_delay_secs);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 && self.shutdown.wait_timeout(delay) {
                return Err(ArchiveError::Shutdown);
            }
            match self.chat.send_file(channel_id, content, path) {
                Ok(sent) => return Ok(sent),
                Err(err) => {
                    last_error = format!("{err:#}");
                    warn!(attempt, error = %last_error, "archive upload failed");
                }
            }
        }
        Err(ArchiveError::UploadFailed(last_error))
    }
}

impl ItemHandler for Processor {
    fn handle(&self, item: &mut QueueItem) -> (bool, Option<String>) {
        match self.process(item) {
            Ok(()) => (true, None),
            Err(err) => {
                // Retryable failures keep the PROCESSING indicator; the
                // terminal marker is applied once via on_terminal_failure.
                debug!(url = %item.url, error = %err, "attempt failed");
                (false, Some(err.as_handler_error()))
            }
        }
    }

    fn on_terminal_failure(&self, item: &QueueItem) {
        self.set_reactions(
            item,
            &[self.reactions.error.as_str()],
            &[
                self.reactions.queued.as_str(),
                self.reactions.processing.as_str(),
            ],
        );
        self.progress.finish_download(&item.url);
        self.progress.finish_transcode(&item.url);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::archiver::adapters::{ChatMessage, GuildComponents, ProbeInfo, VideoDownloader};
    use crate::archiver::domain::DownloadProgress;
    use crate::archiver::ffmpeg::{GpuInfo, ToolSet};
    use crate::archiver::queue::QueueManager;
    use crate::archiver::settings::ArchiverSettings;

    #[derive(Default)]
    struct MockChat {
        reactions: Mutex<Vec<(Vec<String>, Vec<String>)>>,
        replies: Mutex<Vec<String>>,
        sent: Mutex<Vec<String>>,
    }

    impl ChatAdapter for MockChat {
        fn send_file(
            &self,
            _channel_id: u64,
            content: &str,
            file_path: &Path,
        ) -> anyhow::Result<SentFile> {
            self.sent.lock().unwrap().push(content.to_string());
            anyhow::ensure!(file_path.exists(), "file must exist at upload time");
            Ok(SentFile {
                message_id: 4242,
                attachment_url: "a://uploaded".to_string(),
            })
        }

        fn edit_reactions(
            &self,
            _channel_id: u64,
            _message_id: u64,
            add: &[String],
            remove: &[String],
        ) -> anyhow::Result<()> {
            self.reactions
                .lock()
                .unwrap()
                .push((add.to_vec(), remove.to_vec()));
            Ok(())
        }

        fn reply(&self, _channel_id: u64, _message_id: u64, content: &str) -> anyhow::Result<()> {
            self.replies.lock().unwrap().push(content.to_string());
            Ok(())
        }

        fn fetch_message(
            &self,
            channel_id: u64,
            message_id: u64,
        ) -> anyhow::Result<Option<ChatMessage>> {
            Ok(Some(ChatMessage {
                message_id,
                channel_id,
                author_id: 1,
                author_name: "alice".to_string(),
                channel_name: "clips".to_string(),
            }))
        }

        fn get_channel(
            &self,
            _guild_id: u64,
            _kind: crate::archiver::adapters::ChannelKind,
        ) -> Option<u64> {
            Some(777)
        }
    }

    struct MockDownloader {
        spawned: AtomicU32,
        payload_len: usize,
    }

    impl VideoDownloader for MockDownloader {
        fn probe(&self, _url: &str) -> anyhow::Result<ProbeInfo> {
            Ok(ProbeInfo {
                extractor: "youtube".to_string(),
                title: Some("clip".to_string()),
                duration: Some(5.0),
                resolution: None,
                fps: None,
                format: None,
            })
        }

        fn download(
            &self,
            _url: &str,
            dest: &Path,
            progress: &mut dyn FnMut(&DownloadProgress),
        ) -> anyhow::Result<PathBuf> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let mut state = DownloadProgress::default();
            state.percent = 100.0;
            progress(&state);
            let path = dest.join("clip.mp4");
            std::fs::write(&path, vec![0u8; self.payload_len])?;
            Ok(path)
        }
    }

    struct Fixture {
        processor: Processor,
        chat: Arc<MockChat>,
        downloader: Arc<MockDownloader>,
        index: Arc<ArchiveIndex>,
        _manager: QueueManager,
    }

    fn fixture(payload_len: usize) -> Fixture {
        fixture_with_cancel(payload_len, Arc::new(|_url: &str| false))
    }

    fn fixture_with_cancel(payload_len: usize, cancel: CancelCheck) -> Fixture {
        let shutdown = Arc::new(ShutdownSignal::new());
        let chat = Arc::new(MockChat::default());
        let downloader = Arc::new(MockDownloader {
            spawned: AtomicU32::new(0),
            payload_len,
        });
        let index = Arc::new(ArchiveIndex::open_in_memory().unwrap());

        let guilds = Arc::new(GuildRegistry::new());
        guilds.insert(
            3,
            GuildComponents {
                downloader: downloader.clone(),
                archive_channel_id: 777,
                message_template: "Archived from {author} in #{channel}\n{url}".to_string(),
            },
        );

        // Tool paths never spawn in these tests: the payload stays under
        // the cap and verification is mocked out by the size policy.
        let ffmpeg = Arc::new(FfmpegManager::with_tools(
            ToolSet::from_paths("true".into(), "true".into(), "true".into()),
            GpuInfo::default(),
            shutdown.clone(),
        ));

        let manager = QueueManager::new(&ArchiverSettings::default(), shutdown.clone());
        let settings = ProcessorSettings {
            max_file_size_mb: 8,
            chat_retry_delay_secs: 0,
            ..ProcessorSettings::default()
        };
        let processor = Processor::new(
            chat.clone(),
            guilds,
            index.clone(),
            ffmpeg,
            settings,
            ReactionSet::default(),
            manager.metrics_sink(),
            cancel,
            shutdown,
        )
        .with_artifact_verifier(Arc::new(|_path| Ok(())));
        Fixture {
            processor,
            chat,
            downloader,
            index,
            _manager: manager,
        }
    }

    fn item() -> QueueItem {
        QueueItem::new("https://youtube.com/watch?v=a", 11, 22, 3, 44, 0)
    }

    #[test]
    fn archived_urls_short_circuit_without_tools() {
        let fixture = fixture(1024);
        fixture
            .index
            .put(&ArchiveRecord {
                source_url: "https://youtube.com/watch?v=a".to_string(),
                archive_url: "a://1".to_string(),
                archive_message_id: 1,
                archive_channel_id: 2,
                guild_id: 3,
                archived_at: Utc::now(),
            })
            .unwrap();

        let mut item = item();
        let (ok, error) = fixture.processor.handle(&mut item);
        assert!(ok, "short-circuit must succeed: {error:?}");
        assert_eq!(fixture.downloader.spawned.load(Ordering::SeqCst), 0);

        let replies = fixture.chat.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("a://1"));

        // Archived glyph applied, queued/processing cleared.
        let reactions = fixture.chat.reactions.lock().unwrap();
        assert!(reactions.iter().any(|(add, remove)| {
            add.contains(&"🔄".to_string()) && remove.contains(&"⚙️".to_string())
        }));
    }

    #[test]
    fn missing_guild_components_fail_with_config_missing() {
        let fixture = fixture(1024);
        let mut item = QueueItem::new("https://youtube.com/watch?v=b", 1, 2, 999, 4, 0);
        let (ok, error) = fixture.processor.handle(&mut item);
        assert!(!ok);
        assert!(error.unwrap().starts_with("ConfigMissing:"));
    }

    #[test]
    fn small_files_upload_without_transcoding() {
        let fixture = fixture(1024);
        let mut item = item();
        let (ok, error) = fixture.processor.handle(&mut item);
        assert!(ok, "pipeline should succeed: {error:?}");
        assert!(!item.compression_attempted);
        assert_eq!(item.size_bytes, 1024);

        // The artifact is recorded in the index.
        let record = fixture
            .index
            .get("https://youtube.com/watch?v=a")
            .unwrap()
            .expect("record created");
        assert_eq!(record.archive_url, "a://uploaded");
        assert_eq!(record.archive_message_id, 4242);
        assert_eq!(record.archive_channel_id, 777);

        // Upload content carries the origin attribution.
        let sent = fixture.chat.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("alice"));
        assert!(sent[0].contains("https://youtube.com/watch?v=a"));
    }

    #[test]
    fn terminal_failure_sets_the_error_reaction() {
        let fixture = fixture(1024);
        let item = item();
        fixture.processor.on_terminal_failure(&item);
        let reactions = fixture.chat.reactions.lock().unwrap();
        let (add, remove) = reactions.last().unwrap();
        assert!(add.contains(&"❌".to_string()));
        assert!(remove.contains(&"⚙️".to_string()));
    }

    #[test]
    fn cancelled_items_abort_between_steps() {
        let fixture = fixture_with_cancel(1024, Arc::new(|_url: &str| true));
        let mut item = item();
        let (ok, error) = fixture.processor.handle(&mut item);
        assert!(!ok);
        assert!(error.unwrap().starts_with("Shutdown:"));
        // Cancellation fires before any download work.
        assert_eq!(fixture.downloader.spawned.load(Ordering::SeqCst), 0);
    }
}
