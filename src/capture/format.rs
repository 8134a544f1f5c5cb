//! Format and frame-interval negotiation

use tracing::{info, instrument, warn};

use super::backend::{DeviceBackend, FormatRequest, FrameInterval, GrantedFormat};
use super::device::DeviceHandle;
use crate::error::{CaptureError, Result};

/// Lowest target rate accepted anywhere in the pipeline
pub const MIN_FPS: u32 = 1;
/// Highest target rate accepted anywhere in the pipeline
pub const MAX_FPS: u32 = 120;

pub(crate) fn validate_fps(fps: u32) -> Result<()> {
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
        return Err(CaptureError::InvalidFrameRate {
            fps,
            min: MIN_FPS,
            max: MAX_FPS,
        });
    }
    Ok(())
}

/// Records what was asked for and what the driver granted.
///
/// Everything downstream (buffer sizing, conversion) must size itself from
/// [`FormatNegotiator::granted`], never from the request.
#[derive(Debug, Default)]
pub struct FormatNegotiator {
    requested: Option<FormatRequest>,
    granted: Option<GrantedFormat>,
    interval: Option<FrameInterval>,
}

impl FormatNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Option<&FormatRequest> {
        self.requested.as_ref()
    }

    pub fn granted(&self) -> Option<&GrantedFormat> {
        self.granted.as_ref()
    }

    pub fn interval(&self) -> Option<FrameInterval> {
        self.interval
    }

    /// Ask the driver for `request` and record what it settled on.
    #[instrument(skip(self, device))]
    pub fn negotiate<B: DeviceBackend>(
        &mut self,
        device: &mut DeviceHandle<B>,
        request: FormatRequest,
    ) -> Result<GrantedFormat> {
        if request.width == 0 || request.height == 0 {
            return Err(CaptureError::FormatRejected(format!(
                "invalid resolution {}x{}",
                request.width, request.height
            )));
        }

        let mut granted = device
            .backend_mut()?
            .set_format(&request)
            .map_err(|e| CaptureError::FormatRejected(e.to_string()))?;

        if granted.width == 0 || granted.height == 0 {
            return Err(CaptureError::FormatRejected(format!(
                "driver granted empty resolution {}x{}",
                granted.width, granted.height
            )));
        }
        if granted.format != request.format {
            warn!(
                "Driver substituted {} for requested {}",
                granted.format, request.format
            );
        }
        if (granted.width, granted.height) != (request.width, request.height) {
            warn!(
                "Requested {}x{}, driver granted {}x{}",
                request.width, request.height, granted.width, granted.height
            );
        }

        // Some drivers leave the pitch empty; fill it in for raw formats
        let min_pitch = granted.format.min_bytes_per_line(granted.width);
        if granted.bytes_per_line < min_pitch {
            granted.bytes_per_line = min_pitch;
        }
        if granted.image_size == 0 {
            granted.image_size = granted.bytes_per_line * granted.height;
        }
        if !granted.format.is_compressed() && granted.width % 2 != 0 {
            return Err(CaptureError::FormatRejected(format!(
                "packed 4:2:2 needs an even width, driver granted {}",
                granted.width
            )));
        }

        info!(
            "Format: {}x{} {} ({} bytes/line, {} bytes/frame)",
            granted.width,
            granted.height,
            granted.format,
            granted.bytes_per_line,
            granted.image_size
        );

        self.requested = Some(request);
        self.granted = Some(granted);
        Ok(granted)
    }

    /// Ask for `fps` frames per second. Must happen before buffers are
    /// allocated; changing it later needs a full stop and restart.
    #[instrument(skip(self, device))]
    pub fn set_frame_interval<B: DeviceBackend>(
        &mut self,
        device: &mut DeviceHandle<B>,
        fps: u32,
    ) -> Result<FrameInterval> {
        validate_fps(fps)?;

        let granted = device
            .backend_mut()?
            .set_frame_interval(FrameInterval::from_fps(fps))
            .map_err(|source| CaptureError::FrameIntervalUnsupported { fps, source })?;
        if granted.numerator == 0 || granted.denominator == 0 {
            return Err(CaptureError::FrameIntervalUnsupported {
                fps,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "driver returned {}/{}",
                        granted.numerator, granted.denominator
                    ),
                ),
            });
        }

        self.interval = Some(granted);
        Ok(granted)
    }

    /// Like [`FormatNegotiator::set_frame_interval`], but an interval the
    /// driver will not honor is not an error: the previously granted rate
    /// (if any) stays in effect. Only an out-of-range `fps` is reported.
    pub fn apply_frame_rate<B: DeviceBackend>(
        &mut self,
        device: &mut DeviceHandle<B>,
        fps: u32,
    ) -> Result<Option<FrameInterval>> {
        match self.set_frame_interval(device, fps) {
            Ok(granted) => {
                if granted != FrameInterval::from_fps(fps) {
                    warn!("Requested {} fps, driver granted {:.2} fps", fps, granted.fps());
                } else {
                    info!("Frame rate: {} fps", fps);
                }
                Ok(Some(granted))
            }
            Err(e) if e.is_retryable() => {
                warn!("{}, keeping the device's current rate", e);
                Ok(self.interval)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::capture::synthetic::{SyntheticBackend, SyntheticConfig};

    fn device(config: SyntheticConfig) -> DeviceHandle<SyntheticBackend> {
        DeviceHandle::with_backend("synthetic", SyntheticBackend::new(config)).unwrap()
    }

    fn request(width: u32, height: u32, format: PixelFormat) -> FormatRequest {
        FormatRequest {
            width,
            height,
            format,
        }
    }

    #[test]
    fn test_granted_resolution_recorded() {
        let mut dev = device(SyntheticConfig {
            modes: vec![(320, 240)],
            ..Default::default()
        });
        let mut negotiator = FormatNegotiator::new();

        let granted = negotiator
            .negotiate(&mut dev, request(1280, 720, PixelFormat::Yuyv))
            .unwrap();
        assert_eq!((granted.width, granted.height), (320, 240));
        assert_eq!(negotiator.granted(), Some(&granted));
        assert_eq!(negotiator.requested().map(|r| r.width), Some(1280));
    }

    #[test]
    fn test_negotiation_is_idempotent() {
        let mut dev = device(SyntheticConfig::default());
        let mut negotiator = FormatNegotiator::new();
        let req = request(1280, 720, PixelFormat::Yuyv);

        let first = negotiator.negotiate(&mut dev, req).unwrap();
        let second = negotiator.negotiate(&mut dev, req).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_encoding_substitution() {
        let mut dev = device(SyntheticConfig {
            formats: vec![PixelFormat::Mjpeg],
            ..Default::default()
        });
        let granted = FormatNegotiator::new()
            .negotiate(&mut dev, request(640, 480, PixelFormat::Yuyv))
            .unwrap();
        assert_eq!(granted.format, PixelFormat::Mjpeg);
    }

    #[test]
    fn test_zero_resolution_rejected() {
        let mut dev = device(SyntheticConfig::default());
        let err = FormatNegotiator::new()
            .negotiate(&mut dev, request(0, 480, PixelFormat::Yuyv))
            .unwrap_err();
        assert!(matches!(err, CaptureError::FormatRejected(_)));
    }

    #[test]
    fn test_frame_rate_range() {
        let mut dev = device(SyntheticConfig::default());
        let mut negotiator = FormatNegotiator::new();
        for fps in [0, 121] {
            let err = negotiator.set_frame_interval(&mut dev, fps).unwrap_err();
            assert!(matches!(err, CaptureError::InvalidFrameRate { .. }));
        }
        assert!(negotiator.set_frame_interval(&mut dev, 120).is_ok());
    }

    #[test]
    fn test_frame_rate_clamped_by_driver() {
        let mut dev = device(SyntheticConfig {
            max_fps: 15,
            ..Default::default()
        });
        let granted = FormatNegotiator::new()
            .apply_frame_rate(&mut dev, 30)
            .unwrap()
            .unwrap();
        assert_eq!(granted.fps(), 15.0);
    }

    #[test]
    fn test_unsupported_interval_falls_back() {
        let mut dev = device(SyntheticConfig {
            fail_frame_interval: true,
            ..Default::default()
        });
        let mut negotiator = FormatNegotiator::new();

        let err = negotiator.set_frame_interval(&mut dev, 30).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(negotiator.apply_frame_rate(&mut dev, 30).unwrap(), None);
        assert!(negotiator.apply_frame_rate(&mut dev, 500).is_err());
    }
}
