//! Inline frame-rate gate for the capture loop

use std::time::{Duration, Instant};

use tracing::debug;

use crate::capture::format::validate_fps;
use crate::error::Result;

/// Monotonic time source, swappable for simulated time in tests
pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// `Instant` plus `thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Holds the loop back to the target rate.
///
/// If an iteration overran its slot the next wait is skipped entirely. Lag is
/// dropped, never caught up with a burst.
#[derive(Debug)]
pub struct FramePacer<C: Clock = MonotonicClock> {
    clock: C,
    target_fps: u32,
    interval: Duration,
    last_frame: Option<Instant>,
    slot_start: Option<Instant>,
    frame_count: u64,
    session_start: Instant,
    overruns: u64,
}

impl FramePacer<MonotonicClock> {
    pub fn new(target_fps: u32) -> Result<Self> {
        Self::with_clock(target_fps, MonotonicClock)
    }
}

impl<C: Clock> FramePacer<C> {
    pub fn with_clock(target_fps: u32, clock: C) -> Result<Self> {
        validate_fps(target_fps)?;
        let session_start = clock.now();
        Ok(Self {
            clock,
            target_fps,
            interval: Self::interval_for(target_fps),
            last_frame: None,
            slot_start: None,
            frame_count: 0,
            session_start,
            overruns: 0,
        })
    }

    fn interval_for(fps: u32) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(fps))
    }

    /// Change the target rate; must be within 1..=120.
    pub fn configure(&mut self, target_fps: u32) -> Result<()> {
        validate_fps(target_fps)?;
        self.target_fps = target_fps;
        self.interval = Self::interval_for(target_fps);
        debug!("Pacer target {} fps ({:?} per frame)", target_fps, self.interval);
        Ok(())
    }

    /// Restart the session clock and forget the last frame.
    pub fn restart(&mut self) {
        self.session_start = self.clock.now();
        self.last_frame = None;
        self.slot_start = None;
        self.frame_count = 0;
        self.overruns = 0;
    }

    /// Sleep until the next slot. Returns how long it slept.
    pub fn wait_for_slot(&mut self) -> Duration {
        let waited = match self.last_frame {
            Some(last) => {
                let due = last + self.interval;
                let now = self.clock.now();
                if now < due {
                    let wait = due - now;
                    self.clock.sleep(wait);
                    wait
                } else {
                    if now > due {
                        self.overruns += 1;
                    }
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };
        self.slot_start = Some(self.clock.now());
        waited
    }

    /// Count a frame against the slot opened by the last
    /// [`FramePacer::wait_for_slot`], so time spent processing it does not
    /// stretch the interval.
    pub fn record_frame(&mut self) {
        let now = self.clock.now();
        self.last_frame = Some(self.slot_start.take().unwrap_or(now));
        self.frame_count += 1;
    }

    /// Frames per second since the session started
    pub fn fps(&self) -> f64 {
        let elapsed = self.clock.now().duration_since(self.session_start);
        if elapsed.is_zero() {
            return 0.0;
        }
        self.frame_count as f64 / elapsed.as_secs_f64()
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Slots the loop arrived late for
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn last_frame(&self) -> Option<Instant> {
        self.last_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use std::sync::{Arc, Mutex};

    /// Simulated clock: sleeping advances time instantly
    #[derive(Clone)]
    struct SimClock {
        now: Arc<Mutex<Instant>>,
        slept: Arc<Mutex<Duration>>,
    }

    impl SimClock {
        fn new() -> Self {
            Self {
                now: Arc::new(Mutex::new(Instant::now())),
                slept: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        fn advance(&self, d: Duration) {
            *self.now.lock().unwrap() += d;
        }

        fn slept(&self) -> Duration {
            *self.slept.lock().unwrap()
        }
    }

    impl Clock for SimClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, d: Duration) {
            *self.slept.lock().unwrap() += d;
            self.advance(d);
        }
    }

    #[test]
    fn test_rate_bounds() {
        for fps in [0, 121, 1000] {
            assert!(matches!(
                FramePacer::new(fps),
                Err(CaptureError::InvalidFrameRate { .. })
            ));
        }
        let mut pacer = FramePacer::new(30).unwrap();
        assert!(pacer.configure(1).is_ok());
        assert!(pacer.configure(120).is_ok());
        assert!(pacer.configure(0).is_err());
        assert_eq!(pacer.target_fps(), 120);
    }

    #[test]
    fn test_first_slot_is_free() {
        let clock = SimClock::new();
        let mut pacer = FramePacer::with_clock(30, clock.clone()).unwrap();
        assert_eq!(pacer.wait_for_slot(), Duration::ZERO);
        assert_eq!(clock.slept(), Duration::ZERO);
    }

    #[test]
    fn test_fast_source_converges_to_target() {
        let clock = SimClock::new();
        let mut pacer = FramePacer::with_clock(25, clock.clone()).unwrap();
        let target = Duration::from_millis(40);

        let mut previous: Option<Instant> = None;
        for i in 0..50 {
            pacer.wait_for_slot();
            let slot = clock.now();
            // Dequeue, convert and deliver take 12ms
            clock.advance(Duration::from_millis(12));
            pacer.record_frame();

            if let (Some(prev), true) = (previous, i > 2) {
                let gap = slot - prev;
                assert!(
                    gap >= target.mul_f64(0.9) && gap <= target.mul_f64(1.1),
                    "interval {:?} outside tolerance",
                    gap
                );
            }
            previous = Some(slot);
        }
        assert!((pacer.fps() - 25.0).abs() < 2.5);
    }

    #[test]
    fn test_slow_source_never_sleeps() {
        let clock = SimClock::new();
        let mut pacer = FramePacer::with_clock(60, clock.clone()).unwrap();

        for _ in 0..20 {
            assert_eq!(pacer.wait_for_slot(), Duration::ZERO);
            // 10 fps device, far slower than the target
            clock.advance(Duration::from_millis(100));
            pacer.record_frame();
        }
        assert_eq!(clock.slept(), Duration::ZERO);
        assert_eq!(pacer.overruns(), 19);
    }

    #[test]
    fn test_overrun_does_not_burst() {
        let clock = SimClock::new();
        let mut pacer = FramePacer::with_clock(10, clock.clone()).unwrap();
        pacer.record_frame();

        // One stalled iteration worth five slots
        clock.advance(Duration::from_millis(500));
        assert_eq!(pacer.wait_for_slot(), Duration::ZERO);
        pacer.record_frame();

        // The very next slot is a full interval away again
        assert_eq!(pacer.wait_for_slot(), Duration::from_millis(100));
    }

    #[test]
    fn test_restart_resets_counters() {
        let clock = SimClock::new();
        let mut pacer = FramePacer::with_clock(30, clock.clone()).unwrap();
        pacer.record_frame();
        pacer.record_frame();
        assert_eq!(pacer.frame_count(), 2);

        pacer.restart();
        assert_eq!(pacer.frame_count(), 0);
        assert!(pacer.last_frame().is_none());
        assert_eq!(pacer.fps(), 0.0);
    }
}
