use flume::{Sender, TrySendError};
use tracing::debug;

use super::{Delivery, FrameSink};
use crate::capture::frame::{OwnedFrame, SinkFrame};
use crate::error::{CaptureError, Result};

/// Copies frames into a bounded channel. A full channel drops the frame
/// instead of stalling the capture loop.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<OwnedFrame>,
}

impl ChannelSink {
    pub fn new(tx: Sender<OwnedFrame>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end of a fresh channel
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<OwnedFrame>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self::new(tx), rx)
    }
}

impl FrameSink for ChannelSink {
    fn consume(&mut self, frame: &SinkFrame<'_>) -> Result<Delivery> {
        match self.tx.try_send(frame.to_owned_frame()) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(TrySendError::Full(_)) => {
                debug!("Channel full, dropping frame {}", frame.frame_number);
                Ok(Delivery::Dropped)
            }
            Err(TrySendError::Disconnected(_)) => Err(CaptureError::SinkClosed),
        }
    }
}
