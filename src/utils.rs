//! Device discovery and format listing

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::video::Capture;
use v4l::Device;

use crate::capture::frame::PixelFormat;
use crate::error::{CaptureError, Result};

/// Nodes probed by [`auto_detect_device`]
const MAX_VIDEO_NODES: u32 = 10;

/// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub format: PixelFormat,
}

/// One encoding a device offers, with its frame sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    pub fourcc: [u8; 4],
    pub description: String,
    /// `None` for encodings this crate does not handle
    pub format: Option<PixelFormat>,
    pub sizes: Vec<FrameSizeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSizeInfo {
    Discrete {
        width: u32,
        height: u32,
    },
    Stepwise {
        min_width: u32,
        max_width: u32,
        step_width: u32,
        min_height: u32,
        max_height: u32,
        step_height: u32,
    },
}

impl std::fmt::Display for FrameSizeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            FrameSizeInfo::Discrete { width, height } => write!(f, "{}x{}", width, height),
            FrameSizeInfo::Stepwise {
                min_width,
                max_width,
                step_width,
                min_height,
                max_height,
                step_height,
            } => write!(
                f,
                "{}x{} - {}x{} (step {}x{})",
                min_width, min_height, max_width, max_height, step_width, step_height
            ),
        }
    }
}

/// Pick the encoding to capture with: YUYV first, then MJPEG.
pub fn preferred_format(offered: &[PixelFormat]) -> Option<PixelFormat> {
    [PixelFormat::Yuyv, PixelFormat::Mjpeg]
        .into_iter()
        .find(|wanted| offered.contains(wanted))
}

/// Auto-detect best capture device
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..MAX_VIDEO_NODES {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        match probe_device(&path) {
            Ok(Some(found)) => {
                info!("Found {} device: {} - {}", found.format, path, found.card);
                return Ok(found);
            }
            Ok(None) => debug!("{} offers no usable capture format", path),
            Err(e) => debug!("Skipping {}: {}", path, e),
        }
    }

    Err(CaptureError::DeviceNotFound(PathBuf::from("/dev/video*")))
}

fn probe_device(path: &str) -> Result<Option<FoundDevice>> {
    let dev = Device::with_path(path)?;
    let caps = dev.query_caps()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
        || !caps.capabilities.contains(Flags::STREAMING)
    {
        return Ok(None);
    }

    let offered: Vec<PixelFormat> = dev
        .enum_formats()?
        .iter()
        .filter_map(|desc| PixelFormat::from_fourcc(&desc.fourcc.repr))
        .collect();

    Ok(preferred_format(&offered).map(|format| FoundDevice {
        path: path.to_string(),
        card: caps.card,
        format,
    }))
}

/// Every encoding and frame size `path` reports.
pub fn describe_formats(path: &Path) -> Result<Vec<FormatInfo>> {
    let dev = Device::with_path(path)?;

    let mut formats = Vec::new();
    for desc in dev.enum_formats()? {
        let sizes = match dev.enum_framesizes(desc.fourcc) {
            Ok(sizes) => sizes
                .into_iter()
                .map(|size| match size.size {
                    FrameSizeEnum::Discrete(d) => FrameSizeInfo::Discrete {
                        width: d.width,
                        height: d.height,
                    },
                    FrameSizeEnum::Stepwise(s) => FrameSizeInfo::Stepwise {
                        min_width: s.min_width,
                        max_width: s.max_width,
                        step_width: s.step_width,
                        min_height: s.min_height,
                        max_height: s.max_height,
                        step_height: s.step_height,
                    },
                })
                .collect(),
            Err(e) => {
                debug!("No frame sizes for {}: {}", desc.fourcc, e);
                Vec::new()
            }
        };

        formats.push(FormatInfo {
            fourcc: desc.fourcc.repr,
            description: desc.description,
            format: PixelFormat::from_fourcc(&desc.fourcc.repr),
            sizes,
        });
    }
    Ok(formats)
}

/// Log the device identity and everything it can capture.
pub fn log_device_info(path: &Path) -> Result<()> {
    let dev = Device::with_path(path)?;
    let caps = dev.query_caps()?;
    info!("Device: {}", path.display());
    info!("  Card: {}", caps.card);
    info!("  Driver: {}", caps.driver);
    info!("  Bus: {}", caps.bus);

    for format in describe_formats(path)? {
        info!(
            "  {} ({})",
            String::from_utf8_lossy(&format.fourcc),
            format.description
        );
        for size in &format.sizes {
            info!("    {}", size);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_preferred_over_mjpeg() {
        let offered = [PixelFormat::Mjpeg, PixelFormat::Yuyv];
        assert_eq!(preferred_format(&offered), Some(PixelFormat::Yuyv));
        assert_eq!(
            preferred_format(&[PixelFormat::H264, PixelFormat::Mjpeg]),
            Some(PixelFormat::Mjpeg)
        );
        assert_eq!(preferred_format(&[PixelFormat::H264]), None);
    }

    #[test]
    fn test_frame_size_display() {
        let discrete = FrameSizeInfo::Discrete {
            width: 1280,
            height: 720,
        };
        assert_eq!(discrete.to_string(), "1280x720");

        let stepwise = FrameSizeInfo::Stepwise {
            min_width: 160,
            max_width: 1920,
            step_width: 16,
            min_height: 120,
            max_height: 1080,
            step_height: 8,
        };
        assert_eq!(stepwise.to_string(), "160x120 - 1920x1080 (step 16x8)");
    }

    #[test]
    fn test_describe_missing_device() {
        assert!(describe_formats(Path::new("/dev/camstream-missing")).is_err());
    }
}
