pub mod capture;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

use capture::frame::PixelFormat;
use capture::stream::IoMode;
use capture::synthetic::SyntheticConfig;

pub use error::{CaptureError, Result};

/// Default configuration file, read from the working directory if present
pub const CONFIG_FILE: &str = "camstream.toml";

/// Prefix for environment overrides, e.g. `CAMSTREAM_CAPTURE__FPS=15`
pub const ENV_PREFIX: &str = "CAMSTREAM";

/// Device path that selects the in-process synthetic camera
pub const SYNTHETIC_DEVICE: &str = "synthetic";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub synthetic: SyntheticConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node; empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub io_mode: IoMode,
    /// Convert YUYV to RGB24 before handing frames to the sink
    pub convert: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuyv,
            buffer_count: 4,
            io_mode: IoMode::NonBlocking,
            convert: true,
        }
    }
}

/// Which thread consumes frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    /// The capture loop calls the sink directly
    #[default]
    Inline,
    /// The capture loop publishes into a shared latest-frame slot that a
    /// separate consumer reads
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames buffered between the capture loop and the consumer
    pub channel_capacity: usize,
    /// Sleep after an empty non-blocking dequeue
    pub retry_delay_ms: u64,
    /// Progress log period, 0 disables it
    pub stats_interval_secs: u64,
    pub scheduling: Scheduling,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4,
            retry_delay_ms: 2,
            stats_interval_secs: 5,
            scheduling: Scheduling::Inline,
        }
    }
}

impl Config {
    /// Layer `path` (or [`CONFIG_FILE`] if it exists), then `CAMSTREAM_*`
    /// environment variables, over the defaults. Keys absent from every
    /// source keep their default value.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new(CONFIG_FILE));
        let loaded = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(loaded.try_deserialize()?)
    }

    pub fn uses_synthetic_device(&self) -> bool {
        self.capture.device == SYNTHETIC_DEVICE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.capture.device, "/dev/video0");
        assert_eq!((config.capture.width, config.capture.height), (640, 480));
        assert_eq!(config.capture.fps, 30);
        assert_eq!(config.capture.buffer_count, 4);
        assert_eq!(config.capture.format, PixelFormat::Yuyv);
        assert_eq!(config.pipeline.retry_delay_ms, 2);
        assert!(!config.uses_synthetic_device());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("camstream-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[capture]\ndevice = \"synthetic\"\nfps = 15\nformat = \"mjpeg\"\nio_mode = \"blocking\"\n\n[pipeline]\nscheduling = \"shared\""
        )
        .unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(config.uses_synthetic_device());
        assert_eq!(config.capture.fps, 15);
        assert_eq!(config.capture.format, PixelFormat::Mjpeg);
        assert_eq!(config.capture.io_mode, IoMode::Blocking);
        assert_eq!(config.pipeline.scheduling, Scheduling::Shared);
        // Untouched keys keep their defaults
        assert_eq!(config.capture.width, 640);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = Path::new("/nonexistent/camstream.toml");
        assert!(matches!(
            Config::load(Some(path)),
            Err(CaptureError::Config(_))
        ));
    }
}
