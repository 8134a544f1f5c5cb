//! Shared helpers: sessions and controllers over the synthetic camera

#![allow(dead_code)]

use camstream::capture::synthetic::{SyntheticBackend, SyntheticConfig, SyntheticProbe};
use camstream::capture::{DeviceHandle, IoMode, StreamingController};
use camstream::pipeline::CaptureSession;
use camstream::{CaptureConfig, PipelineConfig, Result};

pub fn synthetic_device(config: SyntheticConfig) -> (DeviceHandle<SyntheticBackend>, SyntheticProbe) {
    let backend = SyntheticBackend::new(config);
    let probe = backend.probe();
    let device = DeviceHandle::with_backend("synthetic", backend).expect("synthetic device opens");
    (device, probe)
}

/// Controller with `count` buffers mapped, not yet streaming
pub fn prepared_controller(
    config: SyntheticConfig,
    count: u32,
) -> (StreamingController<SyntheticBackend>, SyntheticProbe) {
    let (device, probe) = synthetic_device(config);
    let mut controller = StreamingController::new(device, IoMode::NonBlocking);
    controller.prepare(count).expect("buffers allocate");
    (controller, probe)
}

pub fn capture_config(width: u32, height: u32, fps: u32) -> CaptureConfig {
    CaptureConfig {
        device: "synthetic".into(),
        width,
        height,
        fps,
        ..Default::default()
    }
}

/// Pipeline settings without periodic progress logs
pub fn quiet_pipeline() -> PipelineConfig {
    PipelineConfig {
        stats_interval_secs: 0,
        ..Default::default()
    }
}

pub fn synthetic_session(
    synthetic: SyntheticConfig,
    capture: &CaptureConfig,
) -> Result<(CaptureSession<SyntheticBackend>, SyntheticProbe)> {
    let (device, probe) = synthetic_device(synthetic);
    let session = CaptureSession::with_device(device, capture, &quiet_pipeline())?;
    Ok((session, probe))
}
