//! Session counters

use std::time::{Duration, Instant};

use tracing::info;

/// How often `current_fps` is recomputed
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Frames handed to the sink and accepted
    pub total_frames: u64,

    /// Frames the sink could not take, or that failed conversion
    pub dropped_frames: u64,

    /// Dequeue attempts that found nothing ready
    pub empty_polls: u64,

    /// Frame rate over the last completed window
    pub current_fps: f64,

    /// Frame rate since the session started
    pub avg_fps: f64,

    pub elapsed: Duration,
}

impl StatsSnapshot {
    pub fn drop_rate_percent(&self) -> f64 {
        let seen = self.total_frames + self.dropped_frames;
        if seen == 0 {
            return 0.0;
        }
        self.dropped_frames as f64 * 100.0 / seen as f64
    }
}

/// Monotonic frame counters, only reset explicitly.
#[derive(Debug)]
pub struct Statistics {
    total_frames: u64,
    dropped_frames: u64,
    empty_polls: u64,
    current_fps: f64,
    session_start: Instant,
    window_start: Instant,
    window_frames: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(now: Instant) -> Self {
        Self {
            total_frames: 0,
            dropped_frames: 0,
            empty_polls: 0,
            current_fps: 0.0,
            session_start: now,
            window_start: now,
            window_frames: 0,
        }
    }

    pub fn record_delivered(&mut self) {
        self.record_delivered_at(Instant::now());
    }

    fn record_delivered_at(&mut self, now: Instant) {
        self.total_frames += 1;
        self.window_frames += 1;
        metrics::counter!("frames_captured").increment(1);

        let window = now.duration_since(self.window_start);
        if window >= FPS_WINDOW {
            self.current_fps = self.window_frames as f64 / window.as_secs_f64();
            self.window_frames = 0;
            self.window_start = now;
            metrics::gauge!("capture_fps").set(self.current_fps);
        }
    }

    pub fn record_dropped(&mut self) {
        self.dropped_frames += 1;
        metrics::counter!("frames_dropped").increment(1);
    }

    pub fn record_empty(&mut self) {
        self.empty_polls += 1;
    }

    /// Zero every counter and restart the session clock.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn current_fps(&self) -> f64 {
        self.current_fps
    }

    pub fn session_start(&self) -> Instant {
        self.session_start
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> StatsSnapshot {
        let elapsed = now.duration_since(self.session_start);
        let avg_fps = if elapsed.is_zero() {
            0.0
        } else {
            self.total_frames as f64 / elapsed.as_secs_f64()
        };
        StatsSnapshot {
            total_frames: self.total_frames,
            dropped_frames: self.dropped_frames,
            empty_polls: self.empty_polls,
            current_fps: self.current_fps,
            avg_fps,
            elapsed,
        }
    }

    /// One-line progress report
    pub fn log_progress(&self) {
        let s = self.snapshot();
        info!(
            "Frames: {} captured, {} dropped, {:.1} fps (avg {:.1})",
            s.total_frames, s.dropped_frames, s.current_fps, s.avg_fps
        );
    }

    /// End-of-session report
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!("Session summary:");
        info!("  Duration: {:.1}s", s.elapsed.as_secs_f64());
        info!("  Frames captured: {}", s.total_frames);
        info!(
            "  Frames dropped: {} ({:.1}%)",
            s.dropped_frames,
            s.drop_rate_percent()
        );
        info!("  Average fps: {:.2}", s.avg_fps);
        if s.empty_polls > 0 {
            info!("  Empty polls: {}", s.empty_polls);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let start = Instant::now();
        let mut stats = Statistics::starting_at(start);
        for i in 0..5 {
            stats.record_delivered_at(start + Duration::from_millis(i * 10));
        }
        stats.record_dropped();
        stats.record_empty();

        let s = stats.snapshot_at(start + Duration::from_millis(100));
        assert_eq!(s.total_frames, 5);
        assert_eq!(s.dropped_frames, 1);
        assert_eq!(s.empty_polls, 1);
        assert!((s.avg_fps - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_current_fps_per_window() {
        let start = Instant::now();
        let mut stats = Statistics::starting_at(start);

        // 20 frames, 50ms apart: the window closes on the 20th
        for i in 1..=20 {
            stats.record_delivered_at(start + Duration::from_millis(i * 50));
        }
        assert!((stats.current_fps() - 20.0).abs() < 1e-6);

        // Stays put until the next window closes
        stats.record_delivered_at(start + Duration::from_millis(1100));
        assert!((stats.current_fps() - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset() {
        let mut stats = Statistics::new();
        stats.record_delivered();
        stats.record_dropped();
        stats.reset();
        assert_eq!(stats.total_frames(), 0);
        assert_eq!(stats.dropped_frames(), 0);
        assert_eq!(stats.current_fps(), 0.0);
    }

    #[test]
    fn test_drop_rate() {
        let s = StatsSnapshot {
            total_frames: 3,
            dropped_frames: 1,
            ..Default::default()
        };
        assert!((s.drop_rate_percent() - 25.0).abs() < 1e-9);
        assert_eq!(StatsSnapshot::default().drop_rate_percent(), 0.0);
    }
}
