//! In-process camera implementing the same control surface as a V4L2 driver.
//!
//! Buffers are heap memory pre-filled with a test pattern. The driver-side
//! queue is modelled explicitly so misuse (double enqueue, dequeue while
//! stopped) fails the way a kernel driver would, with `EINVAL`.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::{
    BufferInfo, DequeuedBuffer, DeviceBackend, DeviceCapabilities, FormatRequest, FrameInterval,
    GrantedFormat, Region,
};
use super::frame::PixelFormat;

/// Behaviour of a synthetic device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Resolutions the device offers. A request outside this list is granted
    /// the first entry.
    pub modes: Vec<(u32, u32)>,
    /// Encodings the device offers, first entry is the fallback
    pub formats: Vec<PixelFormat>,
    /// Upper bound on granted buffers
    pub max_buffers: u32,
    /// Highest frame rate the sensor runs at
    pub max_fps: u32,
    /// Time between frames; `None` produces frames as fast as they are asked for
    pub frame_period: Option<Duration>,
    /// Extra bytes at the end of each row
    pub row_padding: u32,
    /// Pattern written into every buffer: Y, U, V
    pub pattern: (u8, u8, u8),
    /// Hand buffers back newest-first instead of in queue order
    pub reverse_order: bool,
    pub can_capture: bool,
    pub can_stream: bool,
    pub fail_map_at: Option<u32>,
    pub fail_stream_on: bool,
    pub fail_frame_interval: bool,
    /// Report an I/O error on the n-th dequeue (1-based)
    pub fail_dequeue_at: Option<u64>,
    /// Report only half of each raw buffer as filled
    pub short_frames: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            modes: vec![(640, 480), (320, 240), (1280, 720)],
            formats: vec![PixelFormat::Yuyv, PixelFormat::Mjpeg],
            max_buffers: 16,
            max_fps: 120,
            frame_period: None,
            row_padding: 0,
            pattern: (128, 128, 128),
            reverse_order: false,
            can_capture: true,
            can_stream: true,
            fail_map_at: None,
            fail_stream_on: false,
            fail_frame_interval: false,
            fail_dequeue_at: None,
            short_frames: false,
        }
    }
}

#[derive(Debug)]
struct DriverState {
    format: GrantedFormat,
    interval: FrameInterval,
    buffers: Vec<BufferInfo>,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    dequeued: u64,
    enqueued: u64,
    maps: u32,
    last_frame: Option<Instant>,
}

/// Read access to the driver-side state, for tests and diagnostics
#[derive(Clone)]
pub struct SyntheticProbe {
    state: Arc<Mutex<DriverState>>,
}

impl SyntheticProbe {
    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffers currently owned by the driver
    pub fn queued(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_queued(&self, index: u32) -> bool {
        self.lock().queued.contains(&index)
    }

    pub fn streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn dequeued(&self) -> u64 {
        self.lock().dequeued
    }

    pub fn enqueued(&self) -> u64 {
        self.lock().enqueued
    }

    pub fn maps(&self) -> u32 {
        self.lock().maps
    }

    pub fn format(&self) -> GrantedFormat {
        self.lock().format
    }
}

/// Synthetic capture device
pub struct SyntheticBackend {
    config: SyntheticConfig,
    state: Arc<Mutex<DriverState>>,
    epoch: Instant,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        let (width, height) = config.modes.first().copied().unwrap_or((640, 480));
        let format = config.formats.first().copied().unwrap_or(PixelFormat::Yuyv);
        let granted = Self::layout(&config, width, height, format);

        Self {
            state: Arc::new(Mutex::new(DriverState {
                format: granted,
                interval: FrameInterval::from_fps(config.max_fps.clamp(1, 30)),
                buffers: Vec::new(),
                queued: VecDeque::new(),
                streaming: false,
                sequence: 0,
                dequeued: 0,
                enqueued: 0,
                maps: 0,
                last_frame: None,
            })),
            config,
            epoch: Instant::now(),
        }
    }

    pub fn probe(&self) -> SyntheticProbe {
        SyntheticProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn layout(config: &SyntheticConfig, width: u32, height: u32, format: PixelFormat) -> GrantedFormat {
        if format.is_compressed() {
            // Worst case for a compressed frame, as UVC drivers report it
            let image_size = width * height * 2;
            return GrantedFormat {
                width,
                height,
                format,
                bytes_per_line: 0,
                image_size,
            };
        }

        let bytes_per_line = format.min_bytes_per_line(width) + config.row_padding;
        GrantedFormat {
            width,
            height,
            format,
            bytes_per_line,
            image_size: bytes_per_line * height,
        }
    }

    fn fill(&self, format: &GrantedFormat, buf: &mut [u8]) {
        match format.format {
            PixelFormat::Yuyv => {
                let (y, u, v) = self.config.pattern;
                let row_bytes = format.min_bytes_per_line(format.width) as usize;
                for row in buf.chunks_mut(format.bytes_per_line.max(1) as usize) {
                    let (pixels, padding) = row.split_at_mut(row_bytes.min(row.len()));
                    for macropixel in pixels.chunks_exact_mut(4) {
                        macropixel.copy_from_slice(&[y, u, y, v]);
                    }
                    padding.fill(0);
                }
            }
            PixelFormat::Mjpeg => {
                buf.fill(0);
                if buf.len() >= 4 {
                    buf[..2].copy_from_slice(&[0xFF, 0xD8]);
                    let end = Self::compressed_len(buf.len());
                    buf[end - 2..end].copy_from_slice(&[0xFF, 0xD9]);
                }
            }
            PixelFormat::H264 => {
                buf.fill(0);
                if buf.len() >= 5 {
                    buf[..5].copy_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65]);
                }
            }
            PixelFormat::Rgb24 => {
                let (y, _, _) = self.config.pattern;
                buf.fill(y);
            }
        }
    }

    fn compressed_len(length: usize) -> usize {
        (length / 4).max(4).min(length)
    }

    fn einval(msg: &str) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
    }
}

impl DeviceBackend for SyntheticBackend {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        Ok(DeviceCapabilities {
            driver: "synthetic".into(),
            card: "Synthetic Camera".into(),
            bus: "platform:synthetic".into(),
            can_capture: self.config.can_capture,
            can_stream: self.config.can_stream,
        })
    }

    fn get_format(&self) -> io::Result<GrantedFormat> {
        Ok(self.lock().format)
    }

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<GrantedFormat> {
        let mut state = self.lock();
        if state.streaming || !state.buffers.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }

        let (width, height) = if self.config.modes.contains(&(request.width, request.height)) {
            (request.width, request.height)
        } else {
            self.config
                .modes
                .first()
                .copied()
                .ok_or_else(|| Self::einval("device has no modes"))?
        };
        let format = if self.config.formats.contains(&request.format) {
            request.format
        } else {
            self.config
                .formats
                .first()
                .copied()
                .ok_or_else(|| Self::einval("device has no formats"))?
        };

        state.format = Self::layout(&self.config, width, height, format);
        Ok(state.format)
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval> {
        if self.config.fail_frame_interval {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        let requested = interval.fps().round() as u32;
        let fps = requested.clamp(1, self.config.max_fps.max(1));

        let mut state = self.lock();
        state.interval = FrameInterval::from_fps(fps);
        Ok(state.interval)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut state = self.lock();
        if state.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }

        let granted = count.min(self.config.max_buffers);
        let length = state.format.image_size;
        state.queued.clear();
        state.buffers = (0..granted)
            .map(|index| BufferInfo {
                index,
                offset: index * length.next_multiple_of(4096),
                length,
            })
            .collect();
        debug!("synthetic: {} of {} buffers granted", granted, count);
        Ok(granted)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        self.lock()
            .buffers
            .get(index as usize)
            .copied()
            .ok_or_else(|| Self::einval("no such buffer"))
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<Region> {
        if self.config.fail_map_at == Some(info.index) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        let format = {
            let mut state = self.lock();
            state.maps += 1;
            state.format
        };
        let mut buf = vec![0u8; info.length as usize].into_boxed_slice();
        self.fill(&format, &mut buf);
        Ok(Region::Heap(buf))
    }

    fn enqueue(&mut self, index: u32) -> io::Result<()> {
        let mut state = self.lock();
        if index as usize >= state.buffers.len() {
            return Err(Self::einval("no such buffer"));
        }
        if state.queued.contains(&index) {
            return Err(Self::einval("buffer already queued"));
        }
        state.queued.push_back(index);
        state.enqueued += 1;
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<DequeuedBuffer> {
        let mut state = self.lock();
        if !state.streaming {
            return Err(Self::einval("not streaming"));
        }
        if let Some(n) = self.config.fail_dequeue_at {
            if state.dequeued + 1 == n {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
        }

        let now = Instant::now();
        if let (Some(period), Some(last)) = (self.config.frame_period, state.last_frame) {
            if now.duration_since(last) < period {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
        }

        let next = if self.config.reverse_order {
            state.queued.pop_back()
        } else {
            state.queued.pop_front()
        };
        let index = next.ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

        state.last_frame = Some(now);
        state.sequence = state.sequence.wrapping_add(1);
        state.dequeued += 1;

        let length = state.format.image_size;
        let bytes_used = if state.format.format.is_compressed() {
            Self::compressed_len(length as usize) as u32
        } else if self.config.short_frames {
            length / 2
        } else {
            length
        };

        Ok(DequeuedBuffer {
            index,
            bytes_used,
            timestamp: now.duration_since(self.epoch),
            sequence: state.sequence,
        })
    }

    fn wait_readable(&self) -> io::Result<()> {
        let wait = {
            let state = self.lock();
            match (self.config.frame_period, state.last_frame) {
                (Some(period), Some(last)) => period.saturating_sub(last.elapsed()),
                _ => Duration::ZERO,
            }
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.config.fail_stream_on {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        let mut state = self.lock();
        if state.buffers.is_empty() {
            return Err(Self::einval("no buffers allocated"));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        state.streaming = false;
        // STREAMOFF returns every queued buffer to userspace
        state.queued.clear();
        state.last_frame = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_mode_falls_back() {
        let mut backend = SyntheticBackend::new(SyntheticConfig {
            modes: vec![(320, 240)],
            ..Default::default()
        });
        let granted = backend
            .set_format(&FormatRequest {
                width: 1280,
                height: 720,
                format: PixelFormat::Yuyv,
            })
            .unwrap();
        assert_eq!((granted.width, granted.height), (320, 240));
        assert_eq!(granted.bytes_per_line, 640);
        assert_eq!(granted.image_size, 640 * 240);
    }

    #[test]
    fn test_double_enqueue_rejected() {
        let mut backend = SyntheticBackend::new(SyntheticConfig::default());
        backend.request_buffers(4).unwrap();
        backend.enqueue(1).unwrap();
        let err = backend.enqueue(1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_empty_queue_would_block() {
        let mut backend = SyntheticBackend::new(SyntheticConfig::default());
        backend.request_buffers(2).unwrap();
        backend.stream_on().unwrap();
        let err = backend.dequeue().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_pattern_respects_padding() {
        let mut backend = SyntheticBackend::new(SyntheticConfig {
            modes: vec![(4, 2)],
            row_padding: 4,
            pattern: (10, 20, 30),
            ..Default::default()
        });
        backend
            .set_format(&FormatRequest {
                width: 4,
                height: 2,
                format: PixelFormat::Yuyv,
            })
            .unwrap();
        backend.request_buffers(2).unwrap();
        let info = backend.query_buffer(0).unwrap();
        let region = backend.map_buffer(&info).unwrap();

        assert_eq!(region.len(), 24);
        assert_eq!(&region[..12], &[10, 20, 10, 30, 10, 20, 10, 30, 0, 0, 0, 0]);
    }
}
