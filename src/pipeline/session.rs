//! The capture loop: dequeue, convert, deliver, requeue, paced.

use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::cancel::CancelToken;
use super::pacer::FramePacer;
use super::stats::{Statistics, StatsSnapshot};
use crate::capture::backend::{DeviceBackend, FormatRequest, GrantedFormat};
use crate::capture::convert;
use crate::capture::device::DeviceHandle;
use crate::capture::format::FormatNegotiator;
use crate::capture::frame::{PixelFormat, SinkFrame};
use crate::capture::stream::{Capture, StreamState, StreamingController};
use crate::capture::v4l2::V4l2Backend;
use crate::error::{CaptureError, Result};
use crate::sink::{Delivery, FrameSink, LatestFrame, LatestFrameSink};
use crate::{CaptureConfig, PipelineConfig};

enum Step {
    Continue,
    SinkClosed,
}

/// Owns every capture component for one device and runs the loop.
///
/// Construction negotiates the format and frame interval and maps the
/// buffers; [`CaptureSession::run`] streams until cancelled, the sink
/// closes, or a fatal error. Dropping the session releases everything.
pub struct CaptureSession<B: DeviceBackend = V4l2Backend> {
    controller: StreamingController<B>,
    negotiator: FormatNegotiator,
    granted: GrantedFormat,
    pacer: FramePacer,
    stats: Statistics,
    scratch: Vec<u8>,
    convert: bool,
    retry_delay: Duration,
    stats_interval: Option<Duration>,
}

impl CaptureSession<V4l2Backend> {
    /// Open the V4L2 device named in `capture` and prepare it for streaming.
    pub fn open(capture: &CaptureConfig, pipeline: &PipelineConfig) -> Result<Self> {
        let device = DeviceHandle::open(Path::new(&capture.device))?;
        Self::with_device(device, capture, pipeline)
    }
}

impl<B: DeviceBackend> CaptureSession<B> {
    #[instrument(skip_all, fields(device = %device.path().display()))]
    pub fn with_device(
        device: DeviceHandle<B>,
        capture: &CaptureConfig,
        pipeline: &PipelineConfig,
    ) -> Result<Self> {
        let pacer = FramePacer::new(capture.fps)?;
        let mut controller = StreamingController::new(device, capture.io_mode);
        let mut negotiator = FormatNegotiator::new();

        // Format and interval are fixed before any buffer exists
        let request = FormatRequest {
            width: capture.width,
            height: capture.height,
            format: capture.format,
        };
        let granted = negotiator.negotiate(controller.device_mut()?, request)?;
        negotiator.apply_frame_rate(controller.device_mut()?, capture.fps)?;
        controller.prepare(capture.buffer_count)?;

        let convert = match (capture.convert, granted.format) {
            (true, PixelFormat::Yuyv) => true,
            (true, other) => {
                info!("{} frames are passed through unconverted", other);
                false
            }
            (false, _) => false,
        };
        let scratch = if convert {
            vec![0u8; convert::rgb24_len(granted.width, granted.height)]
        } else {
            Vec::new()
        };

        Ok(Self {
            controller,
            negotiator,
            granted,
            pacer,
            stats: Statistics::new(),
            scratch,
            convert,
            retry_delay: Duration::from_millis(pipeline.retry_delay_ms),
            stats_interval: match pipeline.stats_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }

    pub fn granted(&self) -> &GrantedFormat {
        &self.granted
    }

    pub fn negotiator(&self) -> &FormatNegotiator {
        &self.negotiator
    }

    pub fn controller(&self) -> &StreamingController<B> {
        &self.controller
    }

    pub fn state(&self) -> StreamState {
        self.controller.state()
    }

    /// Buffers in the mapped pool, 0 after teardown
    pub fn buffer_count(&self) -> usize {
        self.controller.pool().map(|p| p.len()).unwrap_or(0)
    }

    /// Whether YUYV frames are converted to RGB24 before delivery
    pub fn converts(&self) -> bool {
        self.convert
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pacer(&self) -> &FramePacer {
        &self.pacer
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Stream into `sink` until `cancel` is set or the sink closes.
    ///
    /// On a fatal error the device is stopped, unmapped and closed before
    /// the error is returned; the session cannot be run again. After an
    /// orderly stop the buffers stay mapped and `run` may be called again.
    pub fn run<S: FrameSink + ?Sized>(
        &mut self,
        sink: &mut S,
        cancel: &CancelToken,
    ) -> Result<StatsSnapshot> {
        if let Err(e) = self.controller.start() {
            self.controller.shutdown();
            return Err(e);
        }
        self.pacer.restart();

        let mut last_report = Instant::now();
        let outcome = loop {
            if cancel.is_cancelled() {
                info!("Capture cancelled");
                break Ok(());
            }

            self.pacer.wait_for_slot();
            match self.step(sink) {
                Ok(Step::Continue) => {}
                Ok(Step::SinkClosed) => {
                    info!("Sink closed, stopping capture");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }

            if let Some(interval) = self.stats_interval {
                if last_report.elapsed() >= interval {
                    self.stats.log_progress();
                    last_report = Instant::now();
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.controller.stop()?;
                self.stats.log_summary();
                Ok(self.stats.snapshot())
            }
            Err(e) => {
                error!("Capture aborted: {}", e);
                self.controller.shutdown();
                self.stats.log_summary();
                Err(e)
            }
        }
    }

    fn step<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> Result<Step> {
        let frame = match self.controller.capture_next()? {
            Capture::Frame(frame) => frame,
            Capture::Empty => {
                self.stats.record_empty();
                thread::sleep(self.retry_delay);
                return Ok(Step::Continue);
            }
        };

        let granted = self.granted;
        let sequence = frame.sequence();
        let view = if self.convert {
            let started = Instant::now();
            match convert::yuyv_to_rgb24_into(
                frame.data(),
                granted.bytes_per_line,
                granted.width,
                granted.height,
                &mut self.scratch,
            ) {
                Ok(()) => {
                    metrics::histogram!("convert_time_us")
                        .record(started.elapsed().as_micros() as f64);
                    Some(SinkFrame {
                        width: granted.width,
                        height: granted.height,
                        format: PixelFormat::Rgb24,
                        data: &self.scratch,
                        bytes_used: self.scratch.len() as u32,
                        timestamp: frame.timestamp(),
                        frame_number: sequence,
                    })
                }
                Err(e) => {
                    warn!("Dropping frame {}: {}", sequence, e);
                    None
                }
            }
        } else {
            Some(SinkFrame {
                width: granted.width,
                height: granted.height,
                format: granted.format,
                data: frame.data(),
                bytes_used: frame.bytes_used(),
                timestamp: frame.timestamp(),
                frame_number: sequence,
            })
        };

        let delivery = match view {
            Some(view) => sink.consume(&view),
            None => Ok(Delivery::Dropped),
        };
        frame.release()?;
        self.pacer.record_frame();

        match delivery {
            Ok(Delivery::Delivered) => self.stats.record_delivered(),
            Ok(Delivery::Replaced) => {
                self.stats.record_delivered();
                self.stats.record_dropped();
            }
            Ok(Delivery::Dropped) => self.stats.record_dropped(),
            Err(CaptureError::SinkClosed) => return Ok(Step::SinkClosed),
            Err(e) => return Err(e),
        }
        Ok(Step::Continue)
    }

    /// Stop, unmap and close now rather than on drop.
    pub fn shutdown(&mut self) {
        debug!("Shutting down capture session");
        self.controller.shutdown();
    }
}

impl<B: DeviceBackend + 'static> CaptureSession<B> {
    /// Run the loop on its own thread, publishing into a shared slot.
    ///
    /// The slot is closed when the loop ends, which wakes any reader blocked
    /// in [`LatestFrame::wait_latest`].
    pub fn spawn(
        self,
        cancel: CancelToken,
    ) -> Result<(LatestFrame, JoinHandle<Result<StatsSnapshot>>)> {
        let slot = LatestFrame::new();
        let producer = slot.clone();
        let handle = thread::Builder::new()
            .name("camstream-capture".into())
            .spawn(move || {
                let mut session = self;
                let mut sink = LatestFrameSink::new(producer.clone());
                let result = session.run(&mut sink, &cancel);
                producer.close();
                result
            })?;
        Ok((slot, handle))
    }
}
