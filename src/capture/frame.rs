use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data copied out of a kernel buffer, safe to keep after the buffer
/// is handed back to the driver
#[derive(Clone)]
pub struct OwnedFrame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Time the copy was taken, for latency tracking
    pub timestamp: Instant,
}

impl fmt::Debug for OwnedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedFrame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bytes_used: u32,
    pub device_timestamp: Duration, // Driver capture timestamp
}

/// Read-only view handed to a sink.
///
/// Borrows either a mapped kernel buffer or the converter's scratch buffer,
/// so it is only valid for the duration of one `FrameSink::consume` call.
#[derive(Debug, Clone, Copy)]
pub struct SinkFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: &'a [u8],
    pub bytes_used: u32,
    pub timestamp: Duration,
    pub frame_number: u64,
}

impl SinkFrame<'_> {
    /// Copy the view into an owned frame.
    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            data: Bytes::copy_from_slice(self.data),
            meta: Arc::new(FrameMetadata {
                sequence: self.frame_number,
                width: self.width,
                height: self.height,
                format: self.format,
                bytes_used: self.bytes_used,
                device_timestamp: self.timestamp,
            }),
            timestamp: Instant::now(),
        }
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, Y0 U Y1 V per macropixel
    Yuyv,
    /// Independently JPEG-coded frames, passed through untouched
    Mjpeg,
    /// H.264 elementary stream, passed through untouched
    H264,
    /// Interleaved 8-bit RGB, produced by the converter
    Rgb24,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::H264 => *b"H264",
            PixelFormat::Rgb24 => *b"RGB3",
        }
    }

    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"H264" => Some(PixelFormat::H264),
            b"RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }

    /// Compressed formats have no fixed line pitch.
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::H264)
    }

    /// Bytes per line of an unpadded frame, 0 for compressed formats
    pub fn min_bytes_per_line(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Yuyv => width * 2,
            PixelFormat::Rgb24 => width * 3,
            PixelFormat::Mjpeg | PixelFormat::H264 => 0,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fourcc = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&fourcc))
    }
}
