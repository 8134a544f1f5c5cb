//! Arena of kernel buffers with explicit ownership

use std::fmt;

use tracing::{debug, info, instrument, warn};

use super::backend::{BufferInfo, DeviceBackend, Region};
use super::device::DeviceHandle;
use crate::error::{CaptureError, Result};

/// Which side may touch a buffer's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Queued on the device, the driver may write into it
    Driver,
    /// Held by the process, readable by the application
    Application,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Driver => write!(f, "driver"),
            Owner::Application => write!(f, "application"),
        }
    }
}

/// One kernel buffer
#[derive(Debug)]
pub struct Buffer {
    info: BufferInfo,
    region: Option<Region>,
    owner: Owner,
}

impl Buffer {
    pub fn index(&self) -> u32 {
        self.info.index
    }

    pub fn len(&self) -> u32 {
        self.info.length
    }

    pub fn is_empty(&self) -> bool {
        self.info.length == 0
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn is_mapped(&self) -> bool {
        self.region.is_some()
    }
}

/// Fixed set of buffers indexed `0..N`. Sized once at allocation.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<Buffer>,
}

impl BufferPool {
    /// Double buffering is the least that keeps the driver fed while the
    /// application holds a frame.
    pub const MIN_BUFFERS: u32 = 2;
    pub const MAX_BUFFERS: u32 = 16;

    /// Request `count` buffers from the driver and record their layout.
    /// Nothing is mapped yet.
    #[instrument(skip(device))]
    pub fn allocate<B: DeviceBackend>(device: &mut DeviceHandle<B>, count: u32) -> Result<Self> {
        let requested = count.clamp(Self::MIN_BUFFERS, Self::MAX_BUFFERS);
        if requested != count {
            warn!(
                "Buffer count {} out of range, requesting {} instead",
                count, requested
            );
        }

        let backend = device.backend_mut()?;
        let granted = backend.request_buffers(requested)?;
        if granted < Self::MIN_BUFFERS {
            if let Err(e) = backend.request_buffers(0) {
                debug!("Releasing short buffer grant failed: {}", e);
            }
            return Err(CaptureError::InsufficientBufferMemory {
                granted,
                minimum: Self::MIN_BUFFERS,
            });
        }
        if granted != requested {
            info!("Driver granted {} of {} buffers", granted, requested);
        }

        let buffers = (0..granted)
            .map(|index| {
                backend.query_buffer(index).map(|info| Buffer {
                    info,
                    region: None,
                    owner: Owner::Application,
                })
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self { buffers })
    }

    /// Map every buffer. If any mapping fails, the ones already made in this
    /// call are released before the error is returned.
    pub fn map_all<B: DeviceBackend>(&mut self, device: &DeviceHandle<B>) -> Result<()> {
        let backend = device.backend()?;

        let mut regions = Vec::with_capacity(self.buffers.len());
        for buffer in &self.buffers {
            match backend.map_buffer(&buffer.info) {
                Ok(region) => regions.push(region),
                Err(source) => {
                    // Dropping the regions unmaps them
                    drop(regions);
                    return Err(CaptureError::MappingFailed {
                        index: buffer.info.index,
                        source,
                    });
                }
            }
        }

        for (buffer, region) in self.buffers.iter_mut().zip(regions) {
            buffer.region = Some(region);
        }
        debug!("Mapped {} buffers", self.buffers.len());
        Ok(())
    }

    /// Release every mapping. Entries already unmapped are skipped.
    pub fn unmap_all(&mut self) {
        let unmapped = self
            .buffers
            .iter_mut()
            .filter_map(|buffer| buffer.region.take())
            .count();
        if unmapped > 0 {
            debug!("Unmapped {} buffers", unmapped);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn is_mapped(&self) -> bool {
        !self.buffers.is_empty() && self.buffers.iter().all(Buffer::is_mapped)
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffer(&self, index: u32) -> Option<&Buffer> {
        self.buffers.get(index as usize)
    }

    /// Length every buffer was allocated with
    pub fn buffer_len(&self) -> u32 {
        self.buffers.first().map(Buffer::len).unwrap_or(0)
    }

    pub fn owned_by(&self, owner: Owner) -> usize {
        self.buffers.iter().filter(|b| b.owner == owner).count()
    }

    /// Index of the buffer currently held by the application, if any
    pub fn in_flight(&self) -> Option<u32> {
        self.buffers
            .iter()
            .find(|b| b.owner == Owner::Application)
            .map(Buffer::index)
    }

    /// Check `index` is owned by `expected`.
    pub fn ensure_owner(&self, index: u32, expected: Owner) -> Result<()> {
        let buffer = self.buffer(index).ok_or_else(|| {
            CaptureError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("driver returned unknown buffer index {}", index),
            ))
        })?;
        if buffer.owner != expected {
            return Err(CaptureError::OwnershipViolation {
                index,
                expected,
                found: buffer.owner,
            });
        }
        Ok(())
    }

    /// Move `index` from `from` to the other side.
    pub(crate) fn transfer(&mut self, index: u32, from: Owner, to: Owner) -> Result<()> {
        self.ensure_owner(index, from)?;
        self.buffers[index as usize].owner = to;
        Ok(())
    }

    /// Mark every buffer as returned to the application, as after STREAMOFF.
    pub(crate) fn reclaim_all(&mut self) {
        for buffer in &mut self.buffers {
            buffer.owner = Owner::Application;
        }
    }

    /// Mapped bytes of `index`, truncated to `bytes_used`.
    pub fn data(&self, index: u32, bytes_used: u32) -> &[u8] {
        match self.buffer(index).and_then(|b| b.region.as_deref()) {
            Some(region) => &region[..(bytes_used as usize).min(region.len())],
            None => &[],
        }
    }
}
