use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, warn};

use crate::archiver::error::ArchiveError;
use crate::archiver::ffmpeg::process_registry::run_with_timeout;
use crate::archiver::settings::ToolSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalToolKind {
    Ffmpeg,
    Ffprobe,
    YtDlp,
}

fn tool_binary_name(kind: ExternalToolKind) -> &'static str {
    match kind {
        ExternalToolKind::Ffmpeg => "ffmpeg",
        ExternalToolKind::Ffprobe => "ffprobe",
        ExternalToolKind::YtDlp => "yt-dlp",
    }
}

fn version_flag(kind: ExternalToolKind) -> &'static str {
    match kind {
        // ffmpeg/ffprobe builds disagree on `--version`; `-version` works
        // everywhere. yt-dlp only understands the long form.
        ExternalToolKind::Ffmpeg | ExternalToolKind::Ffprobe => "-version",
        ExternalToolKind::YtDlp => "--version",
    }
}

fn custom_path_for(kind: ExternalToolKind, settings: &ToolSettings) -> Option<String> {
    match kind {
        ExternalToolKind::Ffmpeg => settings.ffmpeg_path.clone(),
        ExternalToolKind::Ffprobe => settings.ffprobe_path.clone(),
        ExternalToolKind::YtDlp => settings.ytdlp_path.clone(),
    }
}

fn tools_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let dir = exe
        .parent()
        .map(Path::to_path_buf)
        .context("failed to resolve executable directory")?;
    let tools = dir.join("tools");
    fs::create_dir_all(&tools)
        .with_context(|| format!("failed to create tools directory {}", tools.display()))?;
    Ok(tools)
}

fn downloaded_tool_filename(base: &str) -> String {
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}

fn downloaded_tool_path(kind: ExternalToolKind) -> Option<PathBuf> {
    let filename = downloaded_tool_filename(tool_binary_name(kind));
    let candidate = tools_dir().ok()?.join(filename);
    candidate.exists().then_some(candidate)
}

/// Resolution order: explicit custom path, previously downloaded binary,
/// bare name on PATH.
fn resolve_tool_path(kind: ExternalToolKind, settings: &ToolSettings) -> (PathBuf, &'static str) {
    if let Some(custom) = custom_path_for(kind, settings) {
        return (PathBuf::from(custom), "custom");
    }
    if let Some(downloaded) = downloaded_tool_path(kind) {
        return (downloaded, "download");
    }
    (PathBuf::from(tool_binary_name(kind)), "path")
}

fn verify_tool_binary(path: &Path, kind: ExternalToolKind, timeout: Duration) -> bool {
    match run_with_timeout(Command::new(path).arg(version_flag(kind)), timeout) {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Pinned upstream release tag used when fetching static ffmpeg builds.
const FFMPEG_STATIC_TAG: &str = "b6.0";

fn static_download_url(kind: ExternalToolKind) -> Result<String> {
    let base = tool_binary_name(kind);
    if kind == ExternalToolKind::YtDlp {
        let asset = if cfg!(windows) { "yt-dlp.exe" } else { "yt-dlp" };
        return Ok(format!(
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/{asset}"
        ));
    }

    let platform = if cfg!(all(target_os = "windows", target_arch = "x86_64")) {
        "win32-x64"
    } else if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
        "linux-x64"
    } else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
        "linux-arm64"
    } else if cfg!(all(target_os = "macos", target_arch = "x86_64")) {
        "darwin-x64"
    } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "darwin-arm64"
    } else {
        bail!("auto-download for {base} is not supported on this platform");
    };

    Ok(format!(
        "https://github.com/eugeneware/ffmpeg-static/releases/download/{FFMPEG_STATIC_TAG}/{base}-{platform}"
    ))
}

fn download_file(url: &str, dest: &Path) -> Result<()> {
    use reqwest::blocking::Client;

    let dir = dest
        .parent()
        .ok_or_else(|| anyhow!("destination {} has no parent directory", dest.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let client = Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("failed to build HTTP client for tool download")?;

    let mut resp = client
        .get(url)
        .send()
        .with_context(|| format!("failed to download {url}"))?;
    if !resp.status().is_success() {
        bail!("download of {url} failed with status {}", resp.status());
    }

    let mut file =
        fs::File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut buf = [0u8; 8192];
    loop {
        let n = resp.read(&mut buf).context("failed to read download body")?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("failed to write {}", dest.display()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(dest)
            .with_context(|| format!("failed to read metadata for {}", dest.display()))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(dest, perms)
            .with_context(|| format!("failed to mark {} as executable", dest.display()))?;
    }

    Ok(())
}

fn download_tool_binary(kind: ExternalToolKind) -> Result<PathBuf> {
    let url = static_download_url(kind)?;
    let dest = tools_dir()?.join(downloaded_tool_filename(tool_binary_name(kind)));
    info!(tool = tool_binary_name(kind), %url, "auto-downloading tool binary");
    download_file(&url, &dest)?;
    Ok(dest)
}

/// Resolve and verify one tool, auto-downloading a static build when the
/// PATH lookup fails and downloads are enabled.
pub fn ensure_tool_available(kind: ExternalToolKind, settings: &ToolSettings) -> Result<PathBuf> {
    let timeout = Duration::from_secs(settings.verify_timeout_secs);
    let (mut path, source) = resolve_tool_path(kind, settings);
    let mut verified = verify_tool_binary(&path, kind, timeout);

    if !verified && settings.auto_download && source == "path" {
        match download_tool_binary(kind) {
            Ok(downloaded) => {
                path = downloaded;
                verified = verify_tool_binary(&path, kind, timeout);
            }
            Err(err) => {
                warn!(tool = tool_binary_name(kind), error = %format!("{err:#}"), "auto-download failed");
            }
        }
    }

    if !verified {
        bail!(
            "{} does not appear to be available at '{}'; install it or configure a custom path",
            tool_binary_name(kind),
            path.display()
        );
    }
    Ok(path)
}

/// Resolved tool binaries, verified once at startup.
#[derive(Debug, Clone)]
pub struct ToolSet {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub ytdlp: PathBuf,
}

impl ToolSet {
    /// Resolve all binaries and confirm the ffmpeg build carries `libx264`.
    /// A missing encoder is fatal: the pipeline cannot meet its size-cap
    /// contract without a software fallback encoder.
    pub fn ensure(settings: &ToolSettings) -> Result<Self, ArchiveError> {
        let ffmpeg = ensure_tool_available(ExternalToolKind::Ffmpeg, settings)
            .map_err(|err| ArchiveError::ToolMissing(format!("ffmpeg: {err:#}")))?;
        let ffprobe = ensure_tool_available(ExternalToolKind::Ffprobe, settings)
            .map_err(|err| ArchiveError::ToolMissing(format!("ffprobe: {err:#}")))?;
        let ytdlp = ensure_tool_available(ExternalToolKind::YtDlp, settings)
            .map_err(|err| ArchiveError::ToolMissing(format!("yt-dlp: {err:#}")))?;

        let timeout = Duration::from_secs(settings.verify_timeout_secs);
        if !encoder_available(&ffmpeg, "libx264", timeout) {
            return Err(ArchiveError::ToolMissing(
                "ffmpeg build does not provide the libx264 encoder".to_string(),
            ));
        }

        Ok(Self {
            ffmpeg,
            ffprobe,
            ytdlp,
        })
    }

    /// Assemble a tool set from known-good paths, skipping verification.
    /// Used by tests and by hosts that manage binaries themselves.
    pub fn from_paths(ffmpeg: PathBuf, ffprobe: PathBuf, ytdlp: PathBuf) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            ytdlp,
        }
    }
}

pub fn encoder_available(ffmpeg: &Path, encoder: &str, timeout: Duration) -> bool {
    match run_with_timeout(Command::new(ffmpeg).arg("-encoders"), timeout) {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).contains(encoder)
        }
        _ => false,
    }
}
