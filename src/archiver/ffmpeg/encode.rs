use crate::archiver::ffmpeg::probe::VideoInfo;

/// Quality floors so a size target can never starve the streams entirely.
pub const MIN_VIDEO_BITRATE: f64 = 500_000.0;
pub const MIN_AUDIO_BITRATE_PER_CH: f64 = 64_000.0;
pub const MAX_AUDIO_BITRATE_PER_CH: f64 = 192_000.0;
/// Share of the total budget offered to audio before clamping.
const AUDIO_BUDGET_SHARE: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
}

impl GpuVendor {
    pub fn encoder_name(self) -> &'static str {
        match self {
            Self::Nvidia => "h264_nvenc",
            Self::Amd => "h264_amf",
            Self::Intel => "h264_qsv",
        }
    }
}

/// Hardware encoders that passed both the physical-device check and the
/// encoder verification transcode.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuInfo {
    pub nvidia: bool,
    pub amd: bool,
    pub intel: bool,
}

impl GpuInfo {
    pub fn best(self) -> Option<GpuVendor> {
        if self.nvidia {
            Some(GpuVendor::Nvidia)
        } else if self.amd {
            Some(GpuVendor::Amd)
        } else if self.intel {
            Some(GpuVendor::Intel)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Gaming,
    Animation,
    Film,
}

impl ContentType {
    /// Classify content from probe-derived flags. Defaults to film.
    pub fn detect(info: &VideoInfo) -> Self {
        if info.has_high_motion && info.fps >= 60.0 {
            Self::Gaming
        } else {
            Self::Film
        }
    }
}

/// One planned encode attempt, ready to expand into ffmpeg arguments.
#[derive(Debug, Clone)]
pub struct EncodePlan {
    pub codec: String,
    pub hardware: Option<GpuVendor>,
    pub preset: String,
    pub tune: Option<String>,
    pub crf: u8,
    pub threads: usize,
    pub video_bitrate: f64,
    pub audio_bitrate: f64,
    pub audio_channels: u32,
    pub x264_opts: Option<String>,
}

impl EncodePlan {
    /// Expand the plan into `-key value` ffmpeg output arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |k: &str, v: String| {
            args.push(format!("-{k}"));
            args.push(v);
        };

        push("c:v", self.codec.clone());
        match self.hardware {
            Some(GpuVendor::Nvidia) => {
                push("preset", "p7".to_string());
                push("rc:v", "vbr".to_string());
                push("cq:v", "19".to_string());
                push("spatial-aq", "1".to_string());
                push("temporal-aq", "1".to_string());
                push("rc-lookahead", "32".to_string());
            }
            Some(GpuVendor::Amd) => {
                push("quality", "quality".to_string());
                push("rc", "vbr_peak".to_string());
                push("vbaq", "1".to_string());
                push("preanalysis", "1".to_string());
            }
            Some(GpuVendor::Intel) => {
                push("preset", "veryslow".to_string());
                push("look_ahead", "1".to_string());
                push("global_quality", "23".to_string());
            }
            None => {
                push("preset", self.preset.clone());
                push("crf", self.crf.to_string());
                push("profile:v", "high".to_string());
                push("level", "4.1".to_string());
                if let Some(tune) = &self.tune {
                    push("tune", tune.clone());
                }
                if let Some(opts) = &self.x264_opts {
                    push("x264opts", opts.clone());
                }
            }
        }

        push("threads", self.threads.to_string());
        push("pix_fmt", "yuv420p".to_string());
        push("b:v", format!("{}", self.video_bitrate as u64));
        push("maxrate", format!("{}", (self.video_bitrate * 1.5) as u64));
        push("bufsize", format!("{}", (self.video_bitrate * 2.0) as u64));
        push("c:a", "aac".to_string());
        push("b:a", format!("{}k", (self.audio_bitrate / 1000.0) as u64));
        push("ar", "48000".to_string());
        push("ac", self.audio_channels.to_string());
        push("movflags", "+faststart".to_string());
        args
    }
}

/// Builds encode plans from hardware capabilities and content analysis.
#[derive(Debug, Clone)]
pub struct EncoderParams {
    cpu_cores: usize,
    gpu: GpuInfo,
}

impl EncoderParams {
    pub fn new(cpu_cores: usize, gpu: GpuInfo) -> Self {
        Self {
            cpu_cores: cpu_cores.max(1),
            gpu,
        }
    }

    pub fn gpu(&self) -> GpuInfo {
        self.gpu
    }

    /// Compute a plan for transcoding `info` down to `target_size_bytes`.
    /// `hardware` selects an already-verified vendor; `None` is the libx264
    /// baseline used for fallback attempts.
    pub fn plan(
        &self,
        info: &VideoInfo,
        target_size_bytes: u64,
        hardware: Option<GpuVendor>,
    ) -> EncodePlan {
        let (video_bitrate, audio_bitrate) = bitrate_plan(info, target_size_bytes);

        let content = ContentType::detect(info);
        let (mut crf, mut preset, tune, x264_opts): (u8, &str, Option<&str>, &str) = match content {
            ContentType::Gaming => (
                20,
                "fast",
                Some("zerolatency"),
                "rc-lookahead=20:me=hex:subme=6:ref=3:b-adapt=1:direct=spatial",
            ),
            ContentType::Animation => (
                18,
                "slow",
                Some("animation"),
                "rc-lookahead=60:me=umh:subme=9:ref=6:b-adapt=2:direct=auto:deblock=-1,-1",
            ),
            ContentType::Film => (
                22,
                "medium",
                Some("film"),
                "rc-lookahead=50:me=umh:subme=8:ref=4:b-adapt=2:direct=auto",
            ),
        };

        // Compression pressure overrides the content defaults: heavier
        // shrink ratios get a faster preset and looser CRF.
        if info.bitrate > 0.0 {
            let ratio = info.bitrate / video_bitrate;
            if ratio > 4.0 {
                crf = 26;
                preset = "faster";
            } else if ratio > 2.0 {
                crf = 23;
                preset = "medium";
            } else {
                crf = 20;
                preset = "slow";
            }
        }

        if info.has_dark_scenes {
            crf = crf.saturating_sub(2);
        }

        EncodePlan {
            codec: hardware
                .map(|v| v.encoder_name().to_string())
                .unwrap_or_else(|| "libx264".to_string()),
            hardware,
            preset: preset.to_string(),
            tune: tune.map(str::to_string),
            crf,
            threads: self.cpu_cores,
            video_bitrate,
            audio_bitrate,
            audio_channels: info.audio_channels.max(1),
            x264_opts: Some(x264_opts.to_string()),
        }
    }
}

/// Split a total size budget into video/audio bitrates.
///
/// `total = size·8/duration`; audio gets up to 15% of the total clamped to
/// per-channel floors/ceilings; video takes the remainder with a 500 kbps
/// floor.
pub fn bitrate_plan(info: &VideoInfo, target_size_bytes: u64) -> (f64, f64) {
    let duration = if info.duration > 0.0 {
        info.duration
    } else {
        // Unknown duration: assume a short clip so the plan stays usable.
        60.0
    };
    let total = (target_size_bytes as f64) * 8.0 / duration;

    let channels = info.audio_channels.max(1) as f64;
    let audio = (total * AUDIO_BUDGET_SHARE)
        .clamp(
            MIN_AUDIO_BITRATE_PER_CH * channels,
            MAX_AUDIO_BITRATE_PER_CH * channels,
        );
    let video = (total - audio).max(MIN_VIDEO_BITRATE);
    (video, audio)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(duration: f64, bitrate: f64, channels: u32) -> VideoInfo {
        VideoInfo {
            width: 1920,
            height: 1080,
            fps: 30.0,
            duration,
            bitrate,
            audio_bitrate: 128_000.0,
            audio_channels: channels,
            audio_sample_rate: 48_000,
            has_high_motion: false,
            has_dark_scenes: false,
        }
    }

    #[test]
    fn bitrate_plan_splits_the_budget() {
        // 8 MB over 60 s -> ~1.07 Mbps total.
        let (video, audio) = bitrate_plan(&info(60.0, 0.0, 2), 8 * 1024 * 1024);
        let total = 8.0 * 1024.0 * 1024.0 * 8.0 / 60.0;
        assert!((video + audio - total).abs() < 1.0);
        // 15% of ~1.07 Mbps exceeds the 2-channel floor, stays under the cap.
        assert!(audio >= 2.0 * MIN_AUDIO_BITRATE_PER_CH);
        assert!(audio <= 2.0 * MAX_AUDIO_BITRATE_PER_CH);
    }

    #[test]
    fn video_bitrate_never_drops_below_the_floor() {
        // Tiny target over a long duration.
        let (video, _audio) = bitrate_plan(&info(3600.0, 0.0, 2), 1024 * 1024);
        assert!((video - MIN_VIDEO_BITRATE).abs() < 1e-6);
    }

    #[test]
    fn compression_ratio_nudges_crf_and_preset() {
        let params = EncoderParams::new(8, GpuInfo::default());

        // Input at 10 Mbps shrinking to ~1 Mbps: ratio > 4.
        let plan = params.plan(&info(60.0, 10_000_000.0, 2), 8 * 1024 * 1024, None);
        assert_eq!(plan.crf, 26);
        assert_eq!(plan.preset, "faster");

        // Mild shrink: ratio <= 2 selects the slow/20 path.
        let plan = params.plan(&info(60.0, 1_200_000.0, 2), 8 * 1024 * 1024, None);
        assert_eq!(plan.crf, 20);
        assert_eq!(plan.preset, "slow");
    }

    #[test]
    fn dark_scenes_bias_crf_down() {
        let params = EncoderParams::new(8, GpuInfo::default());
        let mut dark = info(60.0, 10_000_000.0, 2);
        dark.has_dark_scenes = true;
        let plan = params.plan(&dark, 8 * 1024 * 1024, None);
        assert_eq!(plan.crf, 24);
    }

    #[test]
    fn hardware_plan_overrides_the_codec() {
        let params = EncoderParams::new(8, GpuInfo::default());
        let plan = params.plan(
            &info(60.0, 0.0, 2),
            8 * 1024 * 1024,
            Some(GpuVendor::Nvidia),
        );
        assert_eq!(plan.codec, "h264_nvenc");
        let args = plan.to_args();
        let codec_pos = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[codec_pos + 1], "h264_nvenc");
        assert!(args.iter().any(|a| a == "-movflags"));
        // Software-only knobs must not leak into the hardware command line.
        assert!(!args.iter().any(|a| a == "-x264opts"));
    }

    #[test]
    fn software_args_carry_the_x264_profile() {
        let params = EncoderParams::new(4, GpuInfo::default());
        let plan = params.plan(&info(60.0, 0.0, 2), 8 * 1024 * 1024, None);
        let args = plan.to_args();
        assert!(args.iter().any(|a| a == "-crf"));
        assert!(args.iter().any(|a| a == "-profile:v"));
        let threads_pos = args.iter().position(|a| a == "-threads").unwrap();
        assert_eq!(args[threads_pos + 1], "4");
    }

    #[test]
    fn gaming_content_detection_requires_motion_and_high_fps() {
        let mut i = info(60.0, 0.0, 2);
        i.fps = 60.0;
        i.has_high_motion = true;
        assert_eq!(ContentType::detect(&i), ContentType::Gaming);
        i.fps = 30.0;
        assert_eq!(ContentType::detect(&i), ContentType::Film);
    }

    #[test]
    fn best_gpu_prefers_nvidia() {
        let gpu = GpuInfo {
            nvidia: true,
            amd: true,
            intel: true,
        };
        assert_eq!(gpu.best(), Some(GpuVendor::Nvidia));
        let gpu = GpuInfo {
            nvidia: false,
            amd: false,
            intel: true,
        };
        assert_eq!(gpu.best(), Some(GpuVendor::Intel));
        assert_eq!(GpuInfo::default().best(), None);
    }
}
