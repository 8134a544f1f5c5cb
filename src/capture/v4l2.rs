//! V4L2 capture backend with memory-mapped zero-copy buffers

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

use memmap2::MmapOptions;
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::memory::Memory;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Fraction};

use super::backend::{
    BufferInfo, DequeuedBuffer, DeviceBackend, DeviceCapabilities, FormatRequest, FrameInterval,
    GrantedFormat, Region,
};
use super::frame::PixelFormat;

/// Buffer queue ioctls. The `v4l` crate only exposes these through its own
/// stream types, which hide buffer ownership.
mod ioctl {
    use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};

    nix::ioctl_readwrite!(reqbufs, b'V', 8, v4l2_requestbuffers);
    nix::ioctl_readwrite!(querybuf, b'V', 9, v4l2_buffer);
    nix::ioctl_readwrite!(qbuf, b'V', 15, v4l2_buffer);
    nix::ioctl_readwrite!(dqbuf, b'V', 17, v4l2_buffer);
    nix::ioctl_write_ptr!(streamon, b'V', 18, libc::c_int);
    nix::ioctl_write_ptr!(streamoff, b'V', 19, libc::c_int);
}

/// Kernel video capture device
pub struct V4l2Backend {
    device: Device,
}

impl V4l2Backend {
    /// Open the device. `v4l` opens with `O_NONBLOCK`, so an empty dequeue
    /// reports `WouldBlock` instead of sleeping inside the ioctl.
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = Device::with_path(path)?;
        Ok(Self { device })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    fn requestbuffers_desc() -> v4l2_requestbuffers {
        v4l2_requestbuffers {
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: plain C struct, all-zero is a valid value
            ..unsafe { mem::zeroed() }
        }
    }

    fn buffer_desc(index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: plain C struct, all-zero is a valid value
            ..unsafe { mem::zeroed() }
        }
    }

    fn granted(fmt: &Format) -> io::Result<GrantedFormat> {
        let format = PixelFormat::from_fourcc(&fmt.fourcc.repr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("driver selected unsupported pixel format {}", fmt.fourcc),
            )
        })?;

        Ok(GrantedFormat {
            width: fmt.width,
            height: fmt.height,
            format,
            bytes_per_line: fmt.stride,
            image_size: fmt.size,
        })
    }
}

impl DeviceBackend for V4l2Backend {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        let caps = self.device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus: caps.bus,
            can_capture: caps.capabilities.contains(CapFlags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(CapFlags::STREAMING),
        })
    }

    fn get_format(&self) -> io::Result<GrantedFormat> {
        Self::granted(&self.device.format()?)
    }

    #[instrument(skip(self))]
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<GrantedFormat> {
        let mut fmt = self.device.format()?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = FourCC::new(&request.format.fourcc());

        let fmt = self.device.set_format(&fmt)?;
        debug!(
            "S_FMT returned {}x{} {} stride={} size={}",
            fmt.width, fmt.height, fmt.fourcc, fmt.stride, fmt.size
        );
        Self::granted(&fmt)
    }

    #[instrument(skip(self))]
    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval> {
        let params = Parameters::new(Fraction::new(interval.numerator, interval.denominator));
        let granted = self.device.set_params(&params)?;

        Ok(FrameInterval {
            numerator: granted.interval.numerator,
            denominator: granted.interval.denominator,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            ..Self::requestbuffers_desc()
        };
        // SAFETY: `req` is a valid, initialized v4l2_requestbuffers
        unsafe { ioctl::reqbufs(self.fd(), &mut req) }?;
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferInfo> {
        let mut buf = Self::buffer_desc(index);
        // SAFETY: `buf` is a valid, initialized v4l2_buffer
        unsafe { ioctl::querybuf(self.fd(), &mut buf) }?;

        Ok(BufferInfo {
            index,
            // SAFETY: the driver fills `offset` for MMAP buffers
            offset: unsafe { buf.m.offset },
            length: buf.length,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> io::Result<Region> {
        // SAFETY: the offset/length pair comes from QUERYBUF on this fd, and
        // the mapping is dropped before the pool is released.
        let map = unsafe {
            MmapOptions::new()
                .offset(u64::from(info.offset))
                .len(info.length as usize)
                .map_mut(self.fd())
        }?;
        Ok(Region::Mapped(map))
    }

    fn enqueue(&mut self, index: u32) -> io::Result<()> {
        let mut buf = Self::buffer_desc(index);
        // SAFETY: `buf` is a valid, initialized v4l2_buffer
        unsafe { ioctl::qbuf(self.fd(), &mut buf) }?;
        Ok(())
    }

    fn dequeue(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buf = Self::buffer_desc(0);
        // SAFETY: `buf` is a valid, initialized v4l2_buffer
        unsafe { ioctl::dqbuf(self.fd(), &mut buf) }?;

        // V4L2 timestamps are non-negative in practice
        let secs = buf.timestamp.tv_sec.max(0) as u64;
        let nanos = (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            timestamp: Duration::new(secs, nanos),
            sequence: buf.sequence,
        })
    }

    fn wait_readable(&self) -> io::Result<()> {
        self.device.handle().poll(libc::POLLIN, -1)?;
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let ty = Type::VideoCapture as libc::c_int;
        // SAFETY: STREAMON reads a single int
        unsafe { ioctl::streamon(self.fd(), &ty) }?;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let ty = Type::VideoCapture as libc::c_int;
        // SAFETY: STREAMOFF reads a single int
        unsafe { ioctl::streamoff(self.fd(), &ty) }?;
        Ok(())
    }
}
