//! Drives the transcode loop against scripted ffmpeg/ffprobe stand-ins,
//! covering the size-cap path with hardware failure and libx264 fallback.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use videoarchiver::ShutdownSignal;
use videoarchiver::archiver::ffmpeg::encode::GpuInfo;
use videoarchiver::archiver::ffmpeg::{FfmpegManager, ToolSet};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/usr/bin/env sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// ffprobe stand-in: emits signalstats luma samples for lavfi graphs and a
/// stream/format JSON document otherwise.
fn fake_ffprobe(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "ffprobe",
        r#"case "$*" in
  *lavfi*)
    echo "120.5"
    echo "88.0"
    exit 0
    ;;
esac
cat <<'EOF'
{
  "streams": [
    {"codec_type": "video", "width": 1280, "height": 720,
     "r_frame_rate": "30/1", "avg_frame_rate": "30/1"}
  ],
  "format": {"duration": "10.0", "bit_rate": "16000000"}
}
EOF
exit 0"#,
    )
}

/// ffmpeg stand-in: hardware encoders fail, libx264 emits progress lines
/// and writes a 4 MiB output.
fn fake_ffmpeg(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "ffmpeg",
        r#"case "$*" in
  *h264_nvenc*|*h264_amf*|*h264_qsv*)
    echo "Cannot load nvenc" >&2
    exit 1
    ;;
esac
for last in "$@"; do :; done
echo "out_time_ms=2500000"
echo "progress=continue"
echo "out_time_ms=5000000"
echo "progress=continue"
echo "out_time_ms=10000000"
echo "progress=end"
dd if=/dev/zero of="$last" bs=1024 count=4096 2>/dev/null
exit 0"#,
    )
}

fn manager_with_gpu(dir: &Path, gpu: GpuInfo) -> FfmpegManager {
    let ffmpeg = fake_ffmpeg(dir);
    let ffprobe = fake_ffprobe(dir);
    let ytdlp = write_script(dir, "yt-dlp", "exit 0");
    FfmpegManager::with_tools(
        ToolSet::from_paths(ffmpeg, ffprobe, ytdlp),
        gpu,
        Arc::new(ShutdownSignal::new()),
    )
}

#[test]
fn probe_reads_dimensions_duration_and_dark_scenes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.mp4");
    fs::write(&input, vec![0u8; 1024]).unwrap();

    let manager = manager_with_gpu(dir.path(), GpuInfo::default());
    let info = manager.probe(&input).unwrap();
    assert_eq!(info.width, 1280);
    assert_eq!(info.height, 720);
    assert_eq!(info.fps, 30.0);
    assert_eq!(info.duration, 10.0);
    // Both sampled I-frames are bright, so no dark-scene bias.
    assert!(!info.has_dark_scenes);
}

#[test]
fn oversized_input_falls_back_to_software_and_fits_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.mp4");
    fs::write(&input, vec![0u8; 20 * 1024 * 1024]).unwrap();
    let output = dir.path().join("compressed_input.mp4");

    // NVIDIA reports available, but its encoder exits non-zero: the run
    // must retry on libx264 and report the hardware failure.
    let manager = manager_with_gpu(
        dir.path(),
        GpuInfo {
            nvidia: true,
            amd: false,
            intel: false,
        },
    );

    let seen = Arc::new(Mutex::new(Vec::<(f64, String)>::new()));
    let seen_clone = seen.clone();
    let hw_failed = manager
        .transcode(&input, &output, 8 * 1024 * 1024, &mut |percent, plan| {
            seen_clone.lock().unwrap().push((percent, plan.codec.clone()));
        })
        .expect("fallback transcode succeeds");

    assert!(hw_failed, "the nvenc attempt must be reported as failed");
    let size = fs::metadata(&output).unwrap().len();
    assert!(size > 0 && size <= 8 * 1024 * 1024);

    let seen = seen.lock().unwrap();
    // Progress flowed from the libx264 attempt, ending at 100%.
    assert!(seen.iter().any(|(_, codec)| codec == "libx264"));
    assert!(seen.iter().any(|(pct, _)| (*pct - 100.0).abs() < 1e-9));
    // out_time_ms=2500000 over a 10 s duration is 25%.
    assert!(seen.iter().any(|(pct, _)| (*pct - 25.0).abs() < 1e-9));
}

#[test]
fn software_only_failure_reports_both_attempt_tails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.mp4");
    fs::write(&input, vec![0u8; 1024]).unwrap();
    let output = dir.path().join("compressed_input.mp4");

    // Replace ffmpeg with one that always fails.
    let ffmpeg = write_script(
        dir.path(),
        "ffmpeg_broken",
        "echo \"encoder exploded\" >&2\nexit 1",
    );
    let ffprobe = fake_ffprobe(dir.path());
    let ytdlp = write_script(dir.path(), "yt-dlp", "exit 0");
    let manager = FfmpegManager::with_tools(
        ToolSet::from_paths(ffmpeg, ffprobe, ytdlp),
        GpuInfo {
            nvidia: true,
            amd: false,
            intel: false,
        },
        Arc::new(ShutdownSignal::new()),
    );

    let err = manager
        .transcode(&input, &output, 8 * 1024 * 1024, &mut |_pct, _plan| {})
        .unwrap_err();
    let text = format!("{err:#}");
    assert!(text.contains("h264_nvenc"), "got: {text}");
    assert!(text.contains("libx264"), "got: {text}");
    assert!(text.contains("encoder exploded"), "got: {text}");
}

#[test]
fn verification_rejects_outputs_without_video_streams() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("artifact.mp4");
    fs::write(&artifact, vec![0u8; 1024]).unwrap();

    let ffprobe = write_script(
        dir.path(),
        "ffprobe_audio_only",
        r#"cat <<'EOF'
{"streams": [{"codec_type": "audio"}], "format": {"duration": "10.0"}}
EOF
exit 0"#,
    );
    let ffmpeg = fake_ffmpeg(dir.path());
    let ytdlp = write_script(dir.path(), "yt-dlp", "exit 0");
    let manager = FfmpegManager::with_tools(
        ToolSet::from_paths(ffmpeg, ffprobe, ytdlp),
        GpuInfo::default(),
        Arc::new(ShutdownSignal::new()),
    );

    let err = manager.verify(&artifact).unwrap_err();
    assert!(format!("{err:#}").contains("no video stream"));
}

mod pipeline {
    //! Scenario: a 20 MiB source against an 8 MiB cap with a flaky
    //! hardware encoder, exercised through the full processor pipeline.

    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use videoarchiver::archiver::domain::DownloadProgress;
    use videoarchiver::archiver::settings::{ArchiverSettings, ProcessorSettings, ReactionSet};
    use videoarchiver::{
        ArchiveIndex, ChatAdapter, GuildComponents, GuildRegistry, Processor, QueueItem,
        QueueManager, ShutdownSignal, VideoDownloader,
    };
    use videoarchiver::archiver::adapters::{ChatMessage, ProbeInfo, SentFile};
    use videoarchiver::archiver::ffmpeg::encode::GpuInfo;
    use videoarchiver::archiver::queue::ItemHandler;

    struct UploadRecorder {
        uploads: AtomicU32,
        last_size: std::sync::Mutex<u64>,
    }

    impl ChatAdapter for UploadRecorder {
        fn send_file(
            &self,
            _channel_id: u64,
            _content: &str,
            file_path: &Path,
        ) -> anyhow::Result<SentFile> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            *self.last_size.lock().unwrap() =
                std::fs::metadata(file_path).map(|m| m.len()).unwrap_or(0);
            Ok(SentFile {
                message_id: 99,
                attachment_url: "a://archived".to_string(),
            })
        }

        fn edit_reactions(
            &self,
            _channel_id: u64,
            _message_id: u64,
            _add: &[String],
            _remove: &[String],
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn reply(&self, _channel_id: u64, _message_id: u64, _content: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn fetch_message(
            &self,
            _channel_id: u64,
            _message_id: u64,
        ) -> anyhow::Result<Option<ChatMessage>> {
            Ok(None)
        }

        fn get_channel(
            &self,
            _guild_id: u64,
            _kind: videoarchiver::archiver::adapters::ChannelKind,
        ) -> Option<u64> {
            Some(777)
        }
    }

    struct BigFileDownloader;

    impl VideoDownloader for BigFileDownloader {
        fn probe(&self, _url: &str) -> anyhow::Result<ProbeInfo> {
            Ok(ProbeInfo {
                extractor: "youtube".to_string(),
                title: Some("big clip".to_string()),
                duration: Some(10.0),
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
            let mut state = DownloadProgress::default();
            state.percent = 100.0;
            progress(&state);
            let path = dest.join("big.mp4");
            std::fs::write(&path, vec![0u8; 20 * 1024 * 1024])?;
            Ok(path)
        }
    }

    #[test]
    fn size_cap_with_hardware_fallback_completes_and_counts_the_failure() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Arc::new(ShutdownSignal::new());

        let ffmpeg = Arc::new(super::manager_with_gpu(
            dir.path(),
            GpuInfo {
                nvidia: true,
                amd: false,
                intel: false,
            },
        ));

        let chat = Arc::new(UploadRecorder {
            uploads: AtomicU32::new(0),
            last_size: std::sync::Mutex::new(0),
        });
        let guilds = Arc::new(GuildRegistry::new());
        guilds.insert(
            3,
            GuildComponents {
                downloader: Arc::new(BigFileDownloader),
                archive_channel_id: 777,
                message_template: "{url}".to_string(),
            },
        );
        let index = Arc::new(ArchiveIndex::open_in_memory().unwrap());

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
            manager.cancel_check(),
            shutdown,
        );

        let mut item = QueueItem::new("https://youtube.com/watch?v=big", 1, 10, 3, 1, 0);
        let (ok, error) = processor.handle(&mut item);
        assert!(ok, "pipeline must complete via fallback: {error:?}");
        assert!(item.compression_attempted);
        assert!(item.hardware_accel_attempted);
        assert_eq!(item.size_bytes, 20 * 1024 * 1024);

        // The uploaded artifact is the compressed rendition, under the cap.
        assert_eq!(chat.uploads.load(Ordering::SeqCst), 1);
        let uploaded = *chat.last_size.lock().unwrap();
        assert!(uploaded > 0 && uploaded <= 8 * 1024 * 1024);

        // Scenario bookkeeping: the hardware failure is counted even though
        // the item itself succeeded, and the URL is indexed once.
        assert_eq!(manager.metrics_snapshot().hardware_accel_failures, 1);
        let record = index
            .get("https://youtube.com/watch?v=big")
            .unwrap()
            .expect("indexed");
        assert_eq!(record.archive_url, "a://archived");
    }
}
