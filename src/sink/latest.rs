//! Single shared slot holding the most recent frame.
//!
//! The capture side locks only to copy a frame in, the reader only to copy
//! it out. The lock is never held across a device or display call.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{Delivery, FrameSink};
use crate::capture::frame::{FrameMetadata, OwnedFrame, SinkFrame};
use crate::error::{CaptureError, Result};

#[derive(Debug, Default)]
struct Slot {
    data: Vec<u8>,
    meta: Option<FrameMetadata>,
    unread: bool,
    closed: bool,
    overwritten: u64,
}

/// Cloneable handle to the shared slot
#[derive(Debug, Clone, Default)]
pub struct LatestFrame {
    inner: Arc<(Mutex<Slot>, Condvar)>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy `frame` into the slot. Returns `true` if it replaced a frame
    /// that was never read.
    pub fn publish(&self, frame: &SinkFrame<'_>) -> Result<bool> {
        let mut slot = self.lock();
        if slot.closed {
            return Err(CaptureError::SinkClosed);
        }

        slot.data.clear();
        slot.data.extend_from_slice(frame.data);
        slot.meta = Some(FrameMetadata {
            sequence: frame.frame_number,
            width: frame.width,
            height: frame.height,
            format: frame.format,
            bytes_used: frame.bytes_used,
            device_timestamp: frame.timestamp,
        });

        let replaced = slot.unread;
        if replaced {
            slot.overwritten += 1;
        }
        slot.unread = true;
        drop(slot);

        self.inner.1.notify_all();
        Ok(replaced)
    }

    /// Copy out the most recent frame, if one was ever published.
    pub fn latest(&self) -> Option<OwnedFrame> {
        let mut slot = self.lock();
        Self::take(&mut slot)
    }

    /// Wait up to `timeout` for a frame newer than the last one read.
    ///
    /// Returns `None` on timeout, or once the producer has closed the slot
    /// and the last frame was already read.
    pub fn wait_latest(&self, timeout: Duration) -> Option<OwnedFrame> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        while !slot.unread && !slot.closed {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .1
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
        if !slot.unread {
            return None;
        }
        Self::take(&mut slot)
    }

    fn take(slot: &mut Slot) -> Option<OwnedFrame> {
        let meta = slot.meta.clone()?;
        slot.unread = false;
        Some(OwnedFrame {
            data: Bytes::copy_from_slice(&slot.data),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        })
    }

    /// Mark the producer as finished and wake any waiting reader.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.1.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Frames replaced before anyone read them
    pub fn overwritten(&self) -> u64 {
        self.lock().overwritten
    }
}

/// Publishes every frame into a [`LatestFrame`] slot
#[derive(Debug, Clone)]
pub struct LatestFrameSink {
    slot: LatestFrame,
}

impl LatestFrameSink {
    pub fn new(slot: LatestFrame) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &LatestFrame {
        &self.slot
    }
}

impl FrameSink for LatestFrameSink {
    fn consume(&mut self, frame: &SinkFrame<'_>) -> Result<Delivery> {
        if self.slot.publish(frame)? {
            Ok(Delivery::Replaced)
        } else {
            Ok(Delivery::Delivered)
        }
    }
}
