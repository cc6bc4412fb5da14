use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{debug, warn};

use crate::archiver::ffmpeg::process_registry::run_with_timeout;

/// Hard deadline for verification probes of finished files.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Frame-rate deviation treated as high-motion content.
const HIGH_MOTION_FPS_DELTA: f64 = 5.0;
/// Mean I-frame luma below this is considered a dark frame.
const DARK_FRAME_LUMA: f64 = 40.0;
/// Dark-frame fraction above which the input counts as dark-scene content.
const DARK_FRAME_RATIO: f64 = 0.2;

/// Properties of an input file that drive encoder parameter selection.
#[derive(Debug, Clone, Default)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration: f64,
    pub bitrate: f64,
    pub audio_bitrate: f64,
    pub audio_channels: u32,
    pub audio_sample_rate: u32,
    pub has_high_motion: bool,
    pub has_dark_scenes: bool,
}

/// Parse an ffprobe rational like `"30000/1001"` into a float.
fn parse_rational(raw: &str) -> Option<f64> {
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    raw.trim().parse().ok()
}

fn value_as_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn value_as_u32(value: Option<&Value>) -> u32 {
    value_as_f64(value) as u32
}

/// Probe stream and container metadata for `input`.
pub fn probe_video(ffprobe: &Path, input: &Path) -> Result<VideoInfo> {
    let output = run_with_timeout(
        Command::new(ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(input),
        VERIFY_TIMEOUT,
    )
    .with_context(|| format!("failed to run ffprobe on {}", input.display()))?;

    if !output.status.success() {
        bail!(
            "ffprobe failed for {}: {}",
            input.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let doc: Value =
        serde_json::from_slice(&output.stdout).context("ffprobe emitted unparseable JSON")?;
    let streams = doc["streams"].as_array().cloned().unwrap_or_default();
    let video = streams
        .iter()
        .find(|s| s["codec_type"] == "video")
        .context("input has no video stream")?;
    let audio = streams.iter().find(|s| s["codec_type"] == "audio");

    let fps = video["r_frame_rate"]
        .as_str()
        .and_then(parse_rational)
        .unwrap_or(30.0);
    let avg_fps = video["avg_frame_rate"].as_str().and_then(parse_rational);
    let has_high_motion = avg_fps.is_some_and(|avg| (avg - fps).abs() > HIGH_MOTION_FPS_DELTA);

    let mut info = VideoInfo {
        width: value_as_u32(video.get("width")),
        height: value_as_u32(video.get("height")),
        fps,
        duration: value_as_f64(doc["format"].get("duration")),
        bitrate: value_as_f64(doc["format"].get("bit_rate")),
        audio_bitrate: audio.map_or(0.0, |a| value_as_f64(a.get("bit_rate"))),
        audio_channels: audio.map_or(2, |a| value_as_u32(a.get("channels")).max(1)),
        audio_sample_rate: audio.map_or(48_000, |a| {
            let rate = value_as_u32(a.get("sample_rate"));
            if rate == 0 { 48_000 } else { rate }
        }),
        has_high_motion,
        has_dark_scenes: false,
    };

    // Dark-scene analysis walks I-frames only; failures downgrade to the
    // non-dark default rather than failing the probe.
    match analyze_dark_scenes(ffprobe, input) {
        Ok(dark) => info.has_dark_scenes = dark,
        Err(err) => warn!(error = %format!("{err:#}"), "dark scene analysis failed"),
    }

    debug!(
        width = info.width,
        height = info.height,
        duration = info.duration,
        high_motion = info.has_high_motion,
        dark = info.has_dark_scenes,
        "probed input"
    );
    Ok(info)
}

/// Sample mean luma of I-frames via `signalstats`; returns whether the dark
/// fraction exceeds the threshold.
fn analyze_dark_scenes(ffprobe: &Path, input: &Path) -> Result<bool> {
    let movie = input.to_string_lossy().replace('\\', "/").replace(':', "\\:");
    let graph = format!("movie={movie},select=eq(pict_type\\,I),signalstats");
    let output = run_with_timeout(
        Command::new(ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-f")
            .arg("lavfi")
            .arg("-i")
            .arg(graph)
            .arg("-show_entries")
            .arg("frame_tags=lavfi.signalstats.YAVG")
            .arg("-of")
            .arg("csv=p=0"),
        VERIFY_TIMEOUT,
    )
    .context("failed to run signalstats probe")?;

    if !output.status.success() {
        bail!(
            "signalstats probe failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let lumas: Vec<f64> = text
        .lines()
        .filter_map(|line| line.trim().trim_end_matches(',').parse::<f64>().ok())
        .collect();
    Ok(dark_fraction_exceeds(&lumas))
}

fn dark_fraction_exceeds(lumas: &[f64]) -> bool {
    if lumas.is_empty() {
        return false;
    }
    let dark = lumas.iter().filter(|&&y| y < DARK_FRAME_LUMA).count();
    (dark as f64 / lumas.len() as f64) > DARK_FRAME_RATIO
}

/// Verify a finished artifact: ffprobe succeeds, at least one video stream,
/// positive duration, file readable and non-empty.
pub fn verify_media_file(ffprobe: &Path, path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("artifact {} is unreadable", path.display()))?;
    if metadata.len() == 0 {
        bail!("artifact {} is empty", path.display());
    }

    let output = run_with_timeout(
        Command::new(ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path),
        VERIFY_TIMEOUT,
    )
    .with_context(|| format!("failed to verify {}", path.display()))?;

    if !output.status.success() {
        bail!(
            "verification probe failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let doc: Value =
        serde_json::from_slice(&output.stdout).context("verification JSON unparseable")?;
    let has_video = doc["streams"]
        .as_array()
        .is_some_and(|streams| streams.iter().any(|s| s["codec_type"] == "video"));
    if !has_video {
        bail!("artifact {} has no video stream", path.display());
    }

    let duration = value_as_f64(doc["format"].get("duration"));
    if duration <= 0.0 {
        bail!("artifact {} has non-positive duration", path.display());
    }
    Ok(())
}
