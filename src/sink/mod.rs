//! Frame consumers.
//!
//! A sink sees each frame as a borrowed [`SinkFrame`] for the duration of one
//! [`FrameSink::consume`] call. Anything it wants to keep must be copied out,
//! usually with [`SinkFrame::to_owned_frame`].

mod channel;
mod latest;

pub use channel::ChannelSink;
pub use latest::{LatestFrame, LatestFrameSink};

use crate::capture::frame::SinkFrame;
use crate::error::Result;

/// What happened to a frame handed to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The sink had no room and discarded the frame
    Dropped,
    /// Delivered, displacing an earlier frame nobody had read
    Replaced,
}

/// Consumer of the paced frame stream.
///
/// Returning [`CaptureError::SinkClosed`](crate::error::CaptureError::SinkClosed)
/// ends the session in an orderly way; any other error aborts it.
pub trait FrameSink {
    fn consume(&mut self, frame: &SinkFrame<'_>) -> Result<Delivery>;
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    fn consume(&mut self, frame: &SinkFrame<'_>) -> Result<Delivery> {
        (**self).consume(frame)
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn consume(&mut self, frame: &SinkFrame<'_>) -> Result<Delivery> {
        (**self).consume(frame)
    }
}

/// Sink backed by a closure
pub struct FnSink<F> {
    f: F,
}

impl<F> FrameSink for FnSink<F>
where
    F: FnMut(&SinkFrame<'_>) -> Result<Delivery>,
{
    fn consume(&mut self, frame: &SinkFrame<'_>) -> Result<Delivery> {
        (self.f)(frame)
    }
}

/// Wrap a closure as a [`FrameSink`].
pub fn sink_fn<F>(f: F) -> FnSink<F>
where
    F: FnMut(&SinkFrame<'_>) -> Result<Delivery>,
{
    FnSink { f }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use std::time::Duration;

    #[test]
    fn test_closure_sink_sees_every_frame() {
        let mut seen = Vec::new();
        let mut sink = sink_fn(|frame: &SinkFrame<'_>| {
            seen.push(frame.frame_number);
            Ok(Delivery::Delivered)
        });

        let data = [0u8; 8];
        for n in 1..=3 {
            let frame = SinkFrame {
                width: 2,
                height: 2,
                format: PixelFormat::Yuyv,
                data: &data,
                bytes_used: 8,
                timestamp: Duration::ZERO,
                frame_number: n,
            };
            assert_eq!(sink.consume(&frame).unwrap(), Delivery::Delivered);
        }
        drop(sink);
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
