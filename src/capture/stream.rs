//! Streaming state machine: `Idle -> Prepared -> Streaming -> Idle`

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::backend::DeviceBackend;
use super::device::DeviceHandle;
use super::pool::{BufferPool, Owner};
use super::v4l2::V4l2Backend;
use crate::error::{is_retry_errno, CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No stream. A mapped pool may still be attached after a stop.
    Idle,
    /// Buffers allocated and mapped, none queued
    Prepared,
    Streaming,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::Prepared => write!(f, "prepared"),
            StreamState::Streaming => write!(f, "streaming"),
        }
    }
}

/// How `capture_next` waits for the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Wait for a filled buffer with `poll(2)`, no timeout
    Blocking,
    /// Return [`Capture::Empty`] immediately when nothing is ready
    #[default]
    NonBlocking,
}

/// Result of one dequeue attempt
pub enum Capture<'a, B: DeviceBackend = V4l2Backend> {
    Frame(Frame<'a, B>),
    /// Nothing ready yet; yield briefly and try again
    Empty,
}

/// A dequeued buffer, owned by the application until released.
///
/// The frame mutably borrows its controller, so no other capture can happen
/// and the data cannot outlive the requeue. Dropping it without calling
/// [`Frame::release`] requeues the buffer as well, logging any error.
pub struct Frame<'a, B: DeviceBackend = V4l2Backend> {
    controller: &'a mut StreamingController<B>,
    index: u32,
    bytes_used: u32,
    timestamp: Duration,
    sequence: u64,
    released: bool,
}

impl<B: DeviceBackend> Frame<'_, B> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn bytes_used(&self) -> u32 {
        self.bytes_used
    }

    /// Driver capture timestamp
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Frames dequeued by this controller, including this one
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &[u8] {
        match &self.controller.pool {
            Some(pool) => pool.data(self.index, self.bytes_used),
            None => &[],
        }
    }

    /// Buffers currently held by the application, this one included
    pub fn application_owned(&self) -> usize {
        self.controller
            .pool
            .as_ref()
            .map(|pool| pool.owned_by(Owner::Application))
            .unwrap_or(0)
    }

    /// Give the buffer back to the driver.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.controller.requeue(self.index)
    }
}

impl<B: DeviceBackend> Drop for Frame<'_, B> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.controller.requeue(self.index) {
                error!("Failed to requeue buffer {}: {}", self.index, e);
            }
        }
    }
}

/// Drives buffer hand-off between the application and the driver.
pub struct StreamingController<B: DeviceBackend = V4l2Backend> {
    device: DeviceHandle<B>,
    pool: Option<BufferPool>,
    state: StreamState,
    io_mode: IoMode,
    dequeued: u64,
}

impl<B: DeviceBackend> StreamingController<B> {
    pub fn new(device: DeviceHandle<B>, io_mode: IoMode) -> Self {
        Self {
            device,
            pool: None,
            state: StreamState::Idle,
            io_mode,
            dequeued: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn io_mode(&self) -> IoMode {
        self.io_mode
    }

    pub fn device(&self) -> &DeviceHandle<B> {
        &self.device
    }

    /// The device, for reconfiguration. Refused while streaming, since the
    /// format is fixed until the stream is stopped.
    pub fn device_mut(&mut self) -> Result<&mut DeviceHandle<B>> {
        if self.state == StreamState::Streaming {
            return Err(CaptureError::InvalidState {
                operation: "reconfigure",
                expected: StreamState::Idle,
                actual: self.state,
            });
        }
        Ok(&mut self.device)
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Allocate and map `buffer_count` buffers. Returns the granted count.
    #[instrument(skip(self))]
    pub fn prepare(&mut self, buffer_count: u32) -> Result<usize> {
        self.ensure_state("prepare", StreamState::Idle)?;
        if self.pool.is_some() {
            self.release_pool();
        }

        let mut pool = BufferPool::allocate(&mut self.device, buffer_count)?;
        if let Err(e) = pool.map_all(&self.device) {
            self.release_kernel_buffers();
            return Err(e);
        }

        let granted = pool.len();
        info!(
            "Prepared {} buffers of {} bytes",
            granted,
            pool.buffer_len()
        );
        self.pool = Some(pool);
        self.state = StreamState::Prepared;
        Ok(granted)
    }

    /// Queue every buffer and switch the stream on.
    ///
    /// Allowed from `Prepared`, or from `Idle` when a stopped stream left its
    /// pool mapped. On failure the controller stays where it was.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        let restartable = self.state == StreamState::Idle
            && self.pool.as_ref().is_some_and(BufferPool::is_mapped);
        if self.state != StreamState::Prepared && !restartable {
            return Err(CaptureError::InvalidState {
                operation: "start",
                expected: StreamState::Prepared,
                actual: self.state,
            });
        }

        let (Some(pool), Ok(backend)) = (self.pool.as_mut(), self.device.backend_mut()) else {
            return Err(CaptureError::DeviceClosed);
        };

        let indices: Vec<u32> = pool.buffers().iter().map(|b| b.index()).collect();
        let mut result = Ok(());
        for &index in &indices {
            if let Err(e) = pool.ensure_owner(index, Owner::Application) {
                result = Err(e);
                break;
            }
            if let Err(e) = backend.enqueue(index) {
                result = Err(CaptureError::StreamStartFailed(e));
                break;
            }
            pool.transfer(index, Owner::Application, Owner::Driver)?;
        }
        if result.is_ok() {
            result = backend.stream_on().map_err(CaptureError::StreamStartFailed);
        }

        if let Err(e) = result {
            // STREAMOFF hands every queued buffer back
            if let Err(off) = backend.stream_off() {
                debug!("STREAMOFF after failed start: {}", off);
            }
            pool.reclaim_all();
            error!("Stream start failed: {}", e);
            return Err(e);
        }

        self.state = StreamState::Streaming;
        info!("Streaming started with {} buffers", indices.len());
        Ok(())
    }

    /// Dequeue the next filled buffer.
    pub fn capture_next(&mut self) -> Result<Capture<'_, B>> {
        self.ensure_state("capture_next", StreamState::Streaming)?;

        let pool = self.pool.as_ref().ok_or(CaptureError::DeviceClosed)?;
        if let Some(index) = pool.in_flight() {
            return Err(CaptureError::OwnershipViolation {
                index,
                expected: Owner::Driver,
                found: Owner::Application,
            });
        }

        let mode = self.io_mode;
        let backend = self.device.backend_mut()?;
        if mode == IoMode::Blocking {
            match backend.wait_readable() {
                Ok(()) => {}
                Err(e) if is_retry_errno(&e) => return Ok(Capture::Empty),
                Err(e) => return Err(CaptureError::CaptureFailed(e)),
            }
        }

        let dequeued = match backend.dequeue() {
            Ok(buf) => buf,
            Err(e) if is_retry_errno(&e) => return Ok(Capture::Empty),
            Err(e) => return Err(CaptureError::CaptureFailed(e)),
        };

        let pool = self.pool.as_mut().ok_or(CaptureError::DeviceClosed)?;
        pool.transfer(dequeued.index, Owner::Driver, Owner::Application)?;
        let bytes_used = dequeued.bytes_used.min(pool.buffer_len());
        self.dequeued += 1;

        Ok(Capture::Frame(Frame {
            index: dequeued.index,
            bytes_used,
            timestamp: dequeued.timestamp,
            sequence: self.dequeued,
            released: false,
            controller: self,
        }))
    }

    fn requeue(&mut self, index: u32) -> Result<()> {
        let pool = self.pool.as_mut().ok_or(CaptureError::DeviceClosed)?;
        pool.ensure_owner(index, Owner::Application)?;

        // After a stop the driver no longer takes buffers; start() requeues
        // everything.
        if self.state != StreamState::Streaming {
            return Ok(());
        }

        self.device
            .backend_mut()?
            .enqueue(index)
            .map_err(CaptureError::CaptureFailed)?;
        pool.transfer(index, Owner::Application, Owner::Driver)
    }

    /// Switch the stream off. Buffers stay mapped for a restart.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_state("stop", StreamState::Streaming)?;

        match self.device.backend_mut() {
            Ok(backend) => {
                if let Err(e) = backend.stream_off() {
                    warn!("STREAMOFF failed, continuing teardown: {}", e);
                }
            }
            Err(e) => warn!("Stopping stream on closed device: {}", e),
        }
        if let Some(pool) = self.pool.as_mut() {
            pool.reclaim_all();
        }

        self.state = StreamState::Idle;
        info!("Streaming stopped after {} frames", self.dequeued);
        Ok(())
    }

    /// Stop, unmap, release kernel buffers and close the device. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == StreamState::Streaming {
            // Only fails on state, which was just checked
            let _ = self.stop();
        }
        self.release_pool();
        self.state = StreamState::Idle;
        self.device.close();
    }

    fn release_pool(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.unmap_all();
            self.release_kernel_buffers();
        }
    }

    fn release_kernel_buffers(&mut self) {
        if let Ok(backend) = self.device.backend_mut() {
            if let Err(e) = backend.request_buffers(0) {
                debug!("Releasing kernel buffers failed: {}", e);
            }
        }
    }

    fn ensure_state(&self, operation: &'static str, expected: StreamState) -> Result<()> {
        if self.state != expected {
            return Err(CaptureError::InvalidState {
                operation,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

impl<B: DeviceBackend> Drop for StreamingController<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
