use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::archiver::ffmpeg::encode::{EncodePlan, EncoderParams};
use crate::archiver::ffmpeg::probe::{self, VideoInfo};
use crate::archiver::ffmpeg::process_registry;
use crate::archiver::shutdown::ShutdownSignal;

/// Bytes of stderr kept per attempt for failure reports.
const STDERR_TAIL_BYTES: usize = 4 * 1024;
const POLL: Duration = Duration::from_millis(50);

/// Parse one `-progress pipe:1` line into elapsed seconds, if it carries
/// timing. `out_time_ms` is in microseconds despite the name.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_ms" | "out_time_us" => value.parse::<f64>().ok().map(|us| us / 1_000_000.0),
        "out_time" => Some(parse_clock_to_seconds(value)),
        _ => None,
    }
}

pub fn is_progress_end(line: &str) -> bool {
    line.trim()
        .strip_prefix("progress=")
        .is_some_and(|rest| rest.eq_ignore_ascii_case("end"))
}

fn parse_clock_to_seconds(s: &str) -> f64 {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() == 3 {
        let h: f64 = parts[0].parse().unwrap_or(0.0);
        let m: f64 = parts[1].parse().unwrap_or(0.0);
        let sec: f64 = parts[2].parse().unwrap_or(0.0);
        return h * 3600.0 + m * 60.0 + sec;
    }
    s.parse().unwrap_or(0.0)
}

/// Line pump for a child's stdout so the control loop can poll cancellation
/// between reads instead of blocking on the pipe.
struct LinePump {
    rx: mpsc::Receiver<String>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl LinePump {
    fn spawn<R: Read + Send + 'static>(reader: R) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let reader = BufReader::new(reader);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }

    fn recv_timeout(&self, dur: Duration) -> Option<String> {
        self.rx.recv_timeout(dur).ok()
    }

    /// Wait for the reader thread to hit EOF, then hand back whatever lines
    /// are still queued. Only valid once the child has exited, so the pipe
    /// is guaranteed to close.
    fn finish(mut self) -> Vec<String> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut lines = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            lines.push(line);
        }
        lines
    }
}

/// Collect a bounded tail of stderr on a separate thread.
struct StderrTail {
    handle: std::thread::JoinHandle<String>,
}

impl StderrTail {
    fn spawn<R: Read + Send + 'static>(reader: R) -> Self {
        let handle = std::thread::spawn(move || {
            let mut tail = String::new();
            let reader = BufReader::new(reader);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                tail.push_str(&line);
                tail.push('\n');
                if tail.len() > STDERR_TAIL_BYTES {
                    let cut = tail.len() - STDERR_TAIL_BYTES;
                    // Keep the cut on a char boundary.
                    let cut = tail
                        .char_indices()
                        .map(|(i, _)| i)
                        .find(|&i| i >= cut)
                        .unwrap_or(0);
                    tail.drain(..cut);
                }
            }
            tail
        });
        Self { handle }
    }

    fn finish(self) -> String {
        self.handle.join().unwrap_or_default()
    }
}

struct AttemptFailure {
    summary: String,
    stderr_tail: String,
}

/// Drives ffmpeg transcodes with hardware-first planning and a libx264
/// fallback retry.
pub struct Transcoder {
    ffmpeg: std::path::PathBuf,
    ffprobe: std::path::PathBuf,
    params: EncoderParams,
    shutdown: Arc<ShutdownSignal>,
}

impl Transcoder {
    pub fn new(
        ffmpeg: std::path::PathBuf,
        ffprobe: std::path::PathBuf,
        params: EncoderParams,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            params,
            shutdown,
        }
    }

    pub fn probe(&self, input: &Path) -> Result<VideoInfo> {
        probe::probe_video(&self.ffprobe, input)
    }

    pub fn gpu(&self) -> crate::archiver::ffmpeg::encode::GpuInfo {
        self.params.gpu()
    }

    /// Transcode `input` into `output` so it fits `target_size_bytes`.
    ///
    /// The first attempt uses the best verified hardware encoder when one
    /// exists; a non-zero exit or failed verification falls back to libx264
    /// exactly once. The returned flag reports whether a hardware attempt
    /// failed along the way, so callers can count it in metrics.
    pub fn transcode(
        &self,
        input: &Path,
        output: &Path,
        target_size_bytes: u64,
        progress_cb: &mut dyn FnMut(f64, &EncodePlan),
    ) -> Result<bool> {
        let info = self.probe(input)?;
        let hardware = self.params.gpu().best();

        let first_plan = self.params.plan(&info, target_size_bytes, hardware);
        let first_failure = match self.run_attempt(input, output, &info, &first_plan, progress_cb) {
            Ok(()) => return Ok(false),
            Err(failure) => failure,
        };

        if first_plan.hardware.is_none() {
            bail!(
                "transcode failed: {}\n--- ffmpeg tail ---\n{}",
                first_failure.summary,
                first_failure.stderr_tail
            );
        }

        warn!(
            encoder = first_plan.codec.as_str(),
            reason = first_failure.summary.as_str(),
            "hardware transcode failed, falling back to libx264"
        );
        let _ = std::fs::remove_file(output);

        let fallback_plan = self.params.plan(&info, target_size_bytes, None);
        match self.run_attempt(input, output, &info, &fallback_plan, progress_cb) {
            Ok(()) => Ok(true),
            Err(second_failure) => bail!(
                "transcode failed on both encoders\n\
                 --- {} ---\n{}\n{}\n--- libx264 ---\n{}\n{}",
                first_plan.codec,
                first_failure.summary,
                first_failure.stderr_tail,
                second_failure.summary,
                second_failure.stderr_tail
            ),
        }
    }

    fn run_attempt(
        &self,
        input: &Path,
        output: &Path,
        info: &VideoInfo,
        plan: &EncodePlan,
        progress_cb: &mut dyn FnMut(f64, &EncodePlan),
    ) -> std::result::Result<(), AttemptFailure> {
        info!(
            input = %input.display(),
            codec = plan.codec.as_str(),
            video_bitrate = plan.video_bitrate as u64,
            "starting transcode attempt"
        );

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(plan.to_args())
            .arg("-progress")
            .arg("pipe:1")
            .arg("-nostats")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| AttemptFailure {
            summary: format!("failed to spawn ffmpeg: {err}"),
            stderr_tail: String::new(),
        })?;
        let _tracked = process_registry::track(&child);

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let pump = LinePump::spawn(stdout);
        let tail = StderrTail::spawn(stderr);

        let status = self.supervise(&mut child, pump, info, plan, progress_cb);
        let stderr_tail = tail.finish();

        let status = match status {
            Ok(status) => status,
            Err(summary) => {
                return Err(AttemptFailure {
                    summary,
                    stderr_tail,
                });
            }
        };

        if !status.success() {
            return Err(AttemptFailure {
                summary: format!("ffmpeg exited with {status}"),
                stderr_tail,
            });
        }

        if let Err(err) = probe::verify_media_file(&self.ffprobe, output) {
            return Err(AttemptFailure {
                summary: format!("output verification failed: {err:#}"),
                stderr_tail,
            });
        }

        debug!(output = %output.display(), "transcode attempt verified");
        Ok(())
    }

    /// Poll loop: forward progress, watch for cancellation, reap the child.
    fn supervise(
        &self,
        child: &mut Child,
        pump: LinePump,
        info: &VideoInfo,
        plan: &EncodePlan,
        progress_cb: &mut dyn FnMut(f64, &EncodePlan),
    ) -> std::result::Result<std::process::ExitStatus, String> {
        let mut handle_line = |line: &str| {
            if let Some(elapsed) = parse_progress_line(line) {
                let fraction = if info.duration > 0.0 {
                    (elapsed / info.duration).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                progress_cb(fraction * 100.0, plan);
            } else if is_progress_end(line) {
                progress_cb(100.0, plan);
            }
        };

        loop {
            if self.shutdown.is_triggered() {
                let _ = child.kill();
                let _ = child.wait();
                return Err("transcode cancelled by shutdown".to_string());
            }

            if let Some(line) = pump.recv_timeout(POLL) {
                handle_line(&line);
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    // The pipe is closed now; flush every buffered line so
                    // the final progress=end marker is never dropped.
                    for line in pump.finish() {
                        handle_line(&line);
                    }
                    return Ok(status);
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("failed to poll ffmpeg: {err}"));
                }
            }
        }
    }
}

/// Name an output next to `input` as `compressed_<name>`.
pub fn compressed_output_path(input: &Path) -> std::path::PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.mp4".to_string());
    input.with_file_name(format!("compressed_{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_parse_out_time_variants() {
        // out_time_ms carries microseconds.
        assert_eq!(parse_progress_line("out_time_ms=1500000"), Some(1.5));
        assert_eq!(parse_progress_line("out_time_us=2000000"), Some(2.0));
        assert_eq!(
            parse_progress_line("out_time=00:01:30.500000"),
            Some(90.5)
        );
        assert_eq!(parse_progress_line("frame=42"), None);
        assert_eq!(parse_progress_line("speed=1.5x"), None);
        assert_eq!(parse_progress_line("plain text"), None);
    }

    #[test]
    fn progress_end_marker_detection() {
        assert!(is_progress_end("progress=end"));
        assert!(is_progress_end("progress=END"));
        assert!(!is_progress_end("progress=continue"));
        assert!(!is_progress_end("out_time_ms=100"));
    }

    #[test]
    fn clock_parsing_handles_fractions() {
        assert_eq!(parse_clock_to_seconds("01:00:00"), 3600.0);
        assert!((parse_clock_to_seconds("00:00:01.25") - 1.25).abs() < 1e-9);
        assert_eq!(parse_clock_to_seconds("90"), 90.0);
    }

    #[test]
    fn compressed_path_prefixes_the_file_name() {
        let out = compressed_output_path(Path::new("/tmp/work/video.mp4"));
        assert_eq!(out, Path::new("/tmp/work/compressed_video.mp4"));
    }
}
