//! Buffer pool and streaming controller behaviour against the synthetic camera

mod common;

use camstream::capture::synthetic::SyntheticConfig;
use camstream::capture::{Capture, Owner, PixelFormat, StreamState};
use camstream::CaptureError;
use common::*;

#[test]
fn test_at_most_one_buffer_with_the_application() {
    let (mut controller, probe) = prepared_controller(SyntheticConfig::default(), 4);
    controller.start().unwrap();

    for _ in 0..20 {
        let Capture::Frame(frame) = controller.capture_next().unwrap() else {
            panic!("synthetic camera should always have a frame ready");
        };
        assert_eq!(frame.application_owned(), 1);
        assert_eq!(probe.queued(), 3);
        frame.release().unwrap();

        let pool = controller.pool().unwrap();
        assert_eq!(pool.owned_by(Owner::Application), 0);
        assert_eq!(pool.owned_by(Owner::Driver), 4);
    }
    assert_eq!(probe.dequeued(), 20);
}

#[test]
fn test_ten_cycles_with_increasing_counters() {
    let (mut controller, _) = prepared_controller(SyntheticConfig::default(), 4);
    controller.start().unwrap();

    let mut last: Option<(u64, std::time::Duration)> = None;
    for _ in 0..10 {
        let Capture::Frame(frame) = controller.capture_next().unwrap() else {
            panic!("expected a frame");
        };
        let current = (frame.sequence(), frame.timestamp());
        if let Some((sequence, timestamp)) = last {
            assert!(current.0 > sequence, "sequence went {} -> {}", sequence, current.0);
            assert!(current.1 >= timestamp);
        }
        last = Some(current);
    }
    assert_eq!(last.map(|(s, _)| s), Some(10));
}

#[test]
fn test_out_of_order_dequeue() {
    let (mut controller, probe) = prepared_controller(
        SyntheticConfig {
            reverse_order: true,
            ..Default::default()
        },
        4,
    );
    controller.start().unwrap();

    let mut indices = Vec::new();
    for _ in 0..4 {
        let Capture::Frame(frame) = controller.capture_next().unwrap() else {
            panic!("expected a frame");
        };
        indices.push(frame.index());
    }
    // Newest-first: the buffer just requeued comes straight back
    assert_eq!(indices, vec![3, 3, 3, 3]);
    assert_eq!(probe.queued(), 4);
}

#[test]
fn test_pool_sized_from_granted_format() {
    let capture = capture_config(1280, 720, 30);
    let (session, _) = synthetic_session(
        SyntheticConfig {
            modes: vec![(320, 240)],
            ..Default::default()
        },
        &capture,
    )
    .unwrap();

    let granted = session.granted();
    assert_eq!((granted.width, granted.height), (320, 240));
    assert_eq!(granted.format, PixelFormat::Yuyv);

    let pool = session.controller().pool().unwrap();
    assert_eq!(pool.buffer_len(), 320 * 240 * 2);
}

#[test]
fn test_single_buffer_grant_is_fatal() {
    let capture = capture_config(640, 480, 30);
    let err = synthetic_session(
        SyntheticConfig {
            max_buffers: 1,
            ..Default::default()
        },
        &capture,
    )
    .err()
    .unwrap();
    assert!(matches!(
        err,
        CaptureError::InsufficientBufferMemory {
            granted: 1,
            minimum: 2
        }
    ));
}

#[test]
fn test_three_buffer_grant_is_enough() {
    let capture = capture_config(640, 480, 30);
    let (session, probe) = synthetic_session(
        SyntheticConfig {
            max_buffers: 3,
            ..Default::default()
        },
        &capture,
    )
    .unwrap();
    assert_eq!(session.buffer_count(), 3);
    assert_eq!(probe.buffer_count(), 3);
    assert_eq!(session.state(), StreamState::Prepared);
}

#[test]
fn test_failed_mapping_releases_everything() {
    let (device, probe) = synthetic_device(SyntheticConfig {
        fail_map_at: Some(2),
        ..Default::default()
    });
    let mut controller = camstream::capture::StreamingController::new(device, Default::default());

    let err = controller.prepare(4).unwrap_err();
    assert!(matches!(err, CaptureError::MappingFailed { index: 2, .. }));
    assert_eq!(controller.state(), StreamState::Idle);
    assert!(controller.pool().is_none());
    assert_eq!(probe.buffer_count(), 0);
}

#[test]
fn test_oversized_request_is_clamped() {
    let (controller, probe) = prepared_controller(SyntheticConfig::default(), 64);
    assert_eq!(controller.pool().unwrap().len(), 16);
    assert_eq!(probe.buffer_count(), 16);
}
