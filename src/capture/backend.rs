//! Device control surface shared by every capture backend
//!
//! The pool, negotiator and streaming controller only talk to a device
//! through [`DeviceBackend`]. The kernel implementation lives in
//! [`crate::capture::v4l2`], an in-process camera in
//! [`crate::capture::synthetic`]. Which one a session uses is decided when it
//! is composed, never with conditional compilation.

use std::io;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use memmap2::MmapMut;

use super::frame::PixelFormat;

/// Capability flags reported by the driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub bus: String,
    pub can_capture: bool,
    pub can_stream: bool,
}

/// What the application asks the driver for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// What the driver actually accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantedFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub bytes_per_line: u32,
    pub image_size: u32,
}

/// Time per frame as a fraction of a second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameInterval {
    pub fn from_fps(fps: u32) -> Self {
        Self {
            numerator: 1,
            denominator: fps,
        }
    }

    pub fn fps(&self) -> f64 {
        if self.numerator == 0 {
            return 0.0;
        }
        f64::from(self.denominator) / f64::from(self.numerator)
    }
}

/// Location of one kernel buffer inside the device's mmap space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// A filled buffer returned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub timestamp: Duration,
    pub sequence: u32,
}

/// Process memory backing one pool buffer.
///
/// Dropping a region unmaps it.
pub enum Region {
    /// Shared mapping of a kernel buffer
    Mapped(MmapMut),
    /// Heap memory standing in for a kernel buffer
    Heap(Box<[u8]>),
}

impl Deref for Region {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Region::Mapped(map) => map,
            Region::Heap(buf) => buf,
        }
    }
}

impl DerefMut for Region {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Region::Mapped(map) => map,
            Region::Heap(buf) => buf,
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::Mapped(map) => write!(f, "Region::Mapped({} bytes)", map.len()),
            Region::Heap(buf) => write!(f, "Region::Heap({} bytes)", buf.len()),
        }
    }
}

/// Device control operations.
///
/// Every call may fail with an OS error. `WouldBlock` and `Interrupted` mean
/// "try again", anything else is fatal to the stream.
pub trait DeviceBackend: Send {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities>;

    fn get_format(&self) -> io::Result<GrantedFormat>;

    /// Request a format; returns whatever the driver settled on.
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<GrantedFormat>;

    /// Request a frame interval; returns whatever the driver settled on.
    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval>;

    /// Ask for `count` buffers, returns the granted count. A count of 0
    /// releases the kernel side of the pool.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo>;

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<Region>;

    /// Hand buffer `index` to the driver.
    fn enqueue(&mut self, index: u32) -> io::Result<()>;

    /// Take the next filled buffer from the driver.
    fn dequeue(&mut self) -> io::Result<DequeuedBuffer>;

    /// Block until a filled buffer is ready. No timeout.
    fn wait_readable(&self) -> io::Result<()>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;
}
