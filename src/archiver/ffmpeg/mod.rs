//! External tool orchestration: binary discovery, GPU probing, encoder
//! parameter planning, and the transcode loop.

pub mod encode;
pub mod gpu;
pub mod probe;
pub(crate) mod process_registry;
pub mod tools;
pub mod transcode;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::archiver::error::ArchiveError;
use crate::archiver::settings::ToolSettings;
use crate::archiver::shutdown::ShutdownSignal;
pub use encode::{EncodePlan, EncoderParams, GpuInfo, GpuVendor};
pub use probe::VideoInfo;
pub use tools::ToolSet;
pub use transcode::{Transcoder, compressed_output_path};

/// Facade owning the resolved tools, detected hardware, and the transcoder.
pub struct FfmpegManager {
    tools: ToolSet,
    transcoder: Transcoder,
}

impl FfmpegManager {
    /// Resolve and verify tools, probe GPUs, and build the transcoder.
    /// Fails with [`ArchiveError::ToolMissing`] when ffmpeg/ffprobe/yt-dlp
    /// cannot be provided or the build lacks `libx264`; hosts must treat
    /// that as fatal and refuse to start.
    pub fn new(settings: &ToolSettings, shutdown: Arc<ShutdownSignal>) -> Result<Self, ArchiveError> {
        let tools = ToolSet::ensure(settings)?;
        let gpu_info = gpu::GpuDetector::new(tools.ffmpeg.clone()).detect();
        info!(
            nvidia = gpu_info.nvidia,
            amd = gpu_info.amd,
            intel = gpu_info.intel,
            "tool orchestration ready"
        );
        Ok(Self::with_tools(tools, gpu_info, shutdown))
    }

    /// Assemble from known tools and capabilities; no verification spawns.
    pub fn with_tools(tools: ToolSet, gpu_info: GpuInfo, shutdown: Arc<ShutdownSignal>) -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let params = EncoderParams::new(cores, gpu_info);
        let transcoder = Transcoder::new(
            tools.ffmpeg.clone(),
            tools.ffprobe.clone(),
            params,
            shutdown,
        );
        Self { tools, transcoder }
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn ytdlp_path(&self) -> &PathBuf {
        &self.tools.ytdlp
    }

    pub fn probe(&self, input: &Path) -> Result<VideoInfo> {
        self.transcoder.probe(input)
    }

    pub fn gpu(&self) -> GpuInfo {
        self.transcoder.gpu()
    }

    pub fn verify(&self, path: &Path) -> Result<()> {
        probe::verify_media_file(&self.tools.ffprobe, path)
    }

    /// See [`Transcoder::transcode`]. Returns whether a hardware attempt
    /// failed before the libx264 fallback succeeded.
    pub fn transcode(
        &self,
        input: &Path,
        output: &Path,
        target_size_bytes: u64,
        progress_cb: &mut dyn FnMut(f64, &EncodePlan),
    ) -> Result<bool> {
        self.transcoder
            .transcode(input, output, target_size_bytes, progress_cb)
    }

    /// Kill every tracked subprocess and sweep for orphaned ffmpeg.
    pub fn kill_all_processes(&self) {
        process_registry::terminate_all();
        process_registry::kill_orphaned_ffmpeg();
    }
}
