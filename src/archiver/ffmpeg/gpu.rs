//! Hardware encoder discovery.
//!
//! A vendor is only enabled when both checks pass: the OS reports a
//! physical device, and the matching ffmpeg encoder survives a one-second
//! test transcode. Either check failing leaves the vendor disabled and the
//! pipeline on the libx264 path.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::archiver::ffmpeg::encode::{GpuInfo, GpuVendor};
use crate::archiver::ffmpeg::process_registry::run_with_timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const ENCODE_TEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GpuDetector {
    ffmpeg: PathBuf,
}

impl GpuDetector {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }

    pub fn detect(&self) -> GpuInfo {
        let physical = detect_physical_gpus();
        debug!(?physical, "physical GPU detection complete");

        let mut info = GpuInfo::default();
        for (vendor, present) in [
            (GpuVendor::Nvidia, physical.nvidia),
            (GpuVendor::Amd, physical.amd),
            (GpuVendor::Intel, physical.intel),
        ] {
            if !present {
                continue;
            }
            if self.verify_encoder(vendor) {
                match vendor {
                    GpuVendor::Nvidia => info.nvidia = true,
                    GpuVendor::Amd => info.amd = true,
                    GpuVendor::Intel => info.intel = true,
                }
                info!(encoder = vendor.encoder_name(), "hardware encoder enabled");
            } else {
                warn!(
                    encoder = vendor.encoder_name(),
                    "device present but encoder failed the test transcode"
                );
            }
        }
        info
    }

    /// Prove the encoder works by transcoding a one-second synthetic source
    /// to the null muxer.
    fn verify_encoder(&self, vendor: GpuVendor) -> bool {
        encoder_test_passes(&self.ffmpeg, vendor.encoder_name())
    }
}

fn encoder_test_passes(ffmpeg: &Path, encoder: &str) -> bool {
    run_with_timeout(
        Command::new(ffmpeg)
            .arg("-hide_banner")
            .arg("-f")
            .arg("lavfi")
            .arg("-i")
            .arg("testsrc=duration=1:size=128x128:rate=30")
            .arg("-c:v")
            .arg(encoder)
            .arg("-f")
            .arg("null")
            .arg("-"),
        ENCODE_TEST_TIMEOUT,
    )
    .map(|output| output.status.success())
    .unwrap_or(false)
}

fn detect_physical_gpus() -> GpuInfo {
    #[cfg(target_os = "linux")]
    {
        detect_linux_gpus()
    }
    #[cfg(target_os = "windows")]
    {
        detect_windows_gpus()
    }
    #[cfg(target_os = "macos")]
    {
        detect_macos_gpus()
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        GpuInfo::default()
    }
}

/// NVML is authoritative when it initializes; `nvidia-smi` is the fallback
/// for systems where the library is unavailable but the driver tools are.
#[cfg(any(target_os = "linux", target_os = "windows"))]
fn detect_nvidia() -> bool {
    match nvml_wrapper::Nvml::init() {
        Ok(nvml) => match nvml.device_count() {
            Ok(count) => return count > 0,
            Err(err) => debug!(error = %err, "NVML device enumeration failed"),
        },
        Err(err) => debug!(error = %err, "NVML unavailable"),
    }

    run_with_timeout(&mut Command::new("nvidia-smi"), PROBE_TIMEOUT)
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn detect_linux_gpus() -> GpuInfo {
    let mut info = GpuInfo {
        nvidia: detect_nvidia(),
        ..GpuInfo::default()
    };

    if let Ok(output) = run_with_timeout(Command::new("lspci").arg("-v"), PROBE_TIMEOUT) {
        if output.status.success() {
            let listing = String::from_utf8_lossy(&output.stdout).to_ascii_lowercase();
            info.amd = listing.contains("amd") || listing.contains("radeon");
            info.intel = listing.contains("intel") && listing.contains("graphics");
        }
    }

    // i915 render nodes are a reliable Intel signal even without lspci.
    if !info.intel
        && let Ok(entries) = std::fs::read_dir("/sys/class/drm")
    {
        info.intel = entries
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("i915"));
    }

    info
}

#[cfg(target_os = "windows")]
fn detect_windows_gpus() -> GpuInfo {
    let mut info = GpuInfo {
        nvidia: detect_nvidia(),
        ..GpuInfo::default()
    };

    let probe = run_with_timeout(
        Command::new("powershell").arg("-Command").arg(
            "Get-WmiObject Win32_VideoController | Select-Object -ExpandProperty Name",
        ),
        PROBE_TIMEOUT,
    );
    if let Ok(output) = probe {
        if output.status.success() {
            let listing = String::from_utf8_lossy(&output.stdout).to_ascii_lowercase();
            info.nvidia = info.nvidia || listing.contains("nvidia");
            info.amd = listing.contains("amd") || listing.contains("radeon");
            info.intel = listing.contains("intel");
        }
    }
    info
}

#[cfg(target_os = "macos")]
fn detect_macos_gpus() -> GpuInfo {
    let mut info = GpuInfo::default();
    let probe = run_with_timeout(
        Command::new("system_profiler").arg("SPDisplaysDataType"),
        PROBE_TIMEOUT,
    );
    if let Ok(output) = probe {
        if output.status.success() {
            let listing = String::from_utf8_lossy(&output.stdout).to_ascii_lowercase();
            info.nvidia = listing.contains("nvidia");
            info.amd = listing.contains("amd") || listing.contains("radeon");
            info.intel = listing.contains("intel");
        }
    }
    info
}
