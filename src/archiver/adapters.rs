//! Capability interfaces between the pipeline core and its collaborators:
//! the chat host, the per-guild configuration bundle, and the video
//! downloader. The core depends only on these traits; production
//! implementations live with the host, except for the yt-dlp subprocess
//! downloader which ships here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::archiver::domain::DownloadProgress;
use crate::archiver::ffmpeg::process_registry;
use crate::archiver::shutdown::ShutdownSignal;
use crate::sync_ext::MutexExt;

/// Channel roles the host can resolve for a guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Archive,
    Notification,
    Log,
}

/// A message uploaded to the archive channel.
#[derive(Debug, Clone)]
pub struct SentFile {
    pub message_id: u64,
    pub attachment_url: String,
}

/// The subset of a chat message the pipeline cares about.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub message_id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub author_name: String,
    pub channel_name: String,
}

/// Inbound chat interface provided by the host. Retries on transient errors
/// are the caller's responsibility unless stated otherwise.
pub trait ChatAdapter: Send + Sync {
    fn send_file(&self, channel_id: u64, content: &str, file_path: &Path) -> Result<SentFile>;

    /// Atomically apply a reaction change set to a message.
    fn edit_reactions(
        &self,
        channel_id: u64,
        message_id: u64,
        add: &[String],
        remove: &[String],
    ) -> Result<()>;

    fn reply(&self, channel_id: u64, message_id: u64, content: &str) -> Result<()>;

    fn fetch_message(&self, channel_id: u64, message_id: u64) -> Result<Option<ChatMessage>>;

    fn get_channel(&self, guild_id: u64, kind: ChannelKind) -> Option<u64>;
}

/// Result of a no-bytes probe against the origin site.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeInfo {
    #[serde(default, alias = "extractor_key")]
    pub extractor: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Downloader capability. `probe` performs a simulated extraction without
/// transferring media bytes; `download` fetches into `dest` and returns the
/// resulting file path.
pub trait VideoDownloader: Send + Sync {
    fn probe(&self, url: &str) -> Result<ProbeInfo>;

    fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut dyn FnMut(&DownloadProgress),
    ) -> Result<PathBuf>;
}

/// Per-guild collaborator bundle resolved by the processor before any
/// external work starts.
#[derive(Clone)]
pub struct GuildComponents {
    pub downloader: Arc<dyn VideoDownloader>,
    pub archive_channel_id: u64,
    /// Template for the archive message; `{author}`, `{channel}` and
    /// `{url}` are substituted.
    pub message_template: String,
}

impl GuildComponents {
    pub fn format_archive_message(&self, origin: Option<&ChatMessage>, url: &str) -> String {
        let author = origin.map_or("unknown", |m| m.author_name.as_str());
        let channel = origin.map_or("unknown", |m| m.channel_name.as_str());
        self.message_template
            .replace("{author}", author)
            .replace("{channel}", channel)
            .replace("{url}", url)
    }
}

/// Registry of guild bundles, owned by the host and shared with the
/// processor.
#[derive(Default)]
pub struct GuildRegistry {
    guilds: Mutex<HashMap<u64, Arc<GuildComponents>>>,
}

impl GuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, guild_id: u64, components: GuildComponents) {
        self.guilds
            .lock_unpoisoned()
            .insert(guild_id, Arc::new(components));
    }

    pub fn remove(&self, guild_id: u64) {
        self.guilds.lock_unpoisoned().remove(&guild_id);
    }

    pub fn get(&self, guild_id: u64) -> Option<Arc<GuildComponents>> {
        self.guilds.lock_unpoisoned().get(&guild_id).cloned()
    }
}

static VIDEO_URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        ^https?://
        (?:[\w.-]+\.)?
        (?: youtube\.com | youtu\.be | vimeo\.com | tiktok\.com | twitch\.tv
          | twitter\.com | x\.com | streamable\.com | reddit\.com
          | instagram\.com | facebook\.com | dailymotion\.com )
        /\S+
        | ^https?://\S+\.(?:mp4|webm|mov|mkv|avi)(?:\?\S*)?$",
    )
    .expect("video url pattern must compile")
});

/// Cheap pre-filter hosts can run before submitting a URL. A `true` result
/// is a hint, not a guarantee; the probe step remains authoritative.
pub fn is_probable_video_url(url: &str) -> bool {
    VIDEO_URL_PATTERN.is_match(url.trim())
}

/// Production downloader backed by the `yt-dlp` binary.
pub struct YtDlpDownloader {
    binary: PathBuf,
    video_format: String,
    max_quality: u32,
    shutdown: Arc<ShutdownSignal>,
}

impl YtDlpDownloader {
    pub fn new(
        binary: PathBuf,
        video_format: String,
        max_quality: u32,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            binary,
            video_format,
            max_quality,
            shutdown,
        }
    }

    fn format_selector(&self) -> String {
        format!(
            "bv*[height<={h}][ext=mp4]+ba[ext=m4a]/b[height<={h}]/best",
            h = self.max_quality
        )
    }
}

static DOWNLOAD_LINE: Lazy<Regex> = Lazy::new(|| {
    // "[download]  42.3% of 10.00MiB at  1.25MiB/s ETA 00:10"
    Regex::new(
        r"(?x)^\[download\]\s+
          (?P<pct>[\d.]+)%
          (?:\s+of\s+~?\s*(?P<total>\S+))?
          (?:\s+at\s+(?P<speed>\S+))?
          (?:\s+ETA\s+(?P<eta>\S+))?",
    )
    .expect("download progress pattern must compile")
});

fn parse_download_line(line: &str, progress: &mut DownloadProgress) -> bool {
    let Some(caps) = DOWNLOAD_LINE.captures(line) else {
        return false;
    };
    if let Some(pct) = caps.name("pct").and_then(|m| m.as_str().parse::<f64>().ok()) {
        progress.percent = pct.clamp(0.0, 100.0);
    }
    progress.speed = caps.name("speed").map(|m| m.as_str().to_string());
    progress.eta = caps.name("eta").map(|m| m.as_str().to_string());
    progress.last_update = Some(chrono::Utc::now());
    true
}

impl VideoDownloader for YtDlpDownloader {
    fn probe(&self, url: &str) -> Result<ProbeInfo> {
        let output = process_registry::run_with_timeout(
            Command::new(&self.binary)
                .arg("--simulate")
                .arg("--dump-json")
                .arg("--no-playlist")
                .arg("--no-warnings")
                .arg(url),
            Duration::from_secs(60),
        )
        .with_context(|| format!("failed to run yt-dlp probe for {url}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Unsupported URL") {
                bail!("unsupported url: {url}");
            }
            bail!("yt-dlp probe failed for {url}: {}", stderr.trim());
        }

        let info: ProbeInfo = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("yt-dlp returned unparseable metadata for {url}"))?;
        Ok(info)
    }

    fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut dyn FnMut(&DownloadProgress),
    ) -> Result<PathBuf> {
        use std::io::{BufRead, BufReader};

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f")
            .arg(self.format_selector())
            .arg("--merge-output-format")
            .arg(&self.video_format)
            .arg("--newline")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("-o")
            .arg(dest.join("%(id)s.%(ext)s"))
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn yt-dlp for {url}"))?;
        let _tracked = process_registry::track(&child);

        let mut state = DownloadProgress {
            active: true,
            ..DownloadProgress::default()
        };

        // Drain stderr on its own thread so a chatty extractor can never
        // stall the child on a full pipe.
        let stderr = child.stderr.take();
        let stderr_pump = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                use std::io::Read;
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        let stdout = child.stdout.take().context("yt-dlp stdout unavailable")?;
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    debug!(error = %err, "yt-dlp output stream closed");
                    break;
                }
            };
            if self.shutdown.is_triggered() {
                let _ = child.kill();
                let _ = child.wait();
                bail!("download cancelled by shutdown");
            }
            if parse_download_line(&line, &mut state) {
                progress(&state);
            }
        }

        let status = child.wait().context("failed to wait for yt-dlp")?;
        let stderr = stderr_pump.join().unwrap_or_default();
        if !status.success() {
            bail!("yt-dlp exited with {status}: {}", stderr.trim());
        }

        // yt-dlp writes exactly one merged file into the scoped directory.
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dest)
            .with_context(|| format!("failed to list {}", dest.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext != "part"))
            .collect();
        entries.sort();
        entries
            .pop()
            .ok_or_else(|| anyhow!("yt-dlp produced no output file for {url}"))
            .inspect(|path| debug!(path = %path.display(), "download complete"))
            .inspect_err(|_| warn!(url, "download finished without an artifact"))
    }
}
