//! Frame timing.

use std::time::{Duration, Instant};

/// Measures per-frame deltas and a rolling average over a report window.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_tick: Instant,
    window_start: Instant,
    window_frames: u32,
    report_interval: Duration,
}

impl FrameTimer {
    /// Create a timer that reports once per `report_interval`.
    pub fn new(report_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            window_start: now,
            window_frames: 0,
            report_interval,
        }
    }

    /// Total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Marks the end of a frame and returns the time since the previous one.
    pub fn tick(&mut self) -> Duration {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Duration {
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.window_frames += 1;
        delta
    }

    /// Returns the average frames per second once a report window has
    /// elapsed, then starts a new window.
    pub fn report(&mut self) -> Option<f32> {
        self.report_at(Instant::now())
    }

    fn report_at(&mut self, now: Instant) -> Option<f32> {
        let window = now - self.window_start;
        if window < self.report_interval || self.window_frames == 0 {
            return None;
        }
        let fps = self.window_frames as f32 / window.as_secs_f32();
        self.window_start = now;
        self.window_frames = 0;
        Some(fps)
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_returns_delta() {
        let mut timer = FrameTimer::default();
        let t0 = timer.last_tick;
        let delta = timer.tick_at(t0 + Duration::from_millis(16));
        assert_eq!(delta, Duration::from_millis(16));
    }

    #[test]
    fn test_report_waits_for_window() {
        let mut timer = FrameTimer::new(Duration::from_secs(1));
        let t0 = timer.window_start;
        for i in 1..=30 {
            timer.tick_at(t0 + Duration::from_millis(i * 20));
        }
        assert!(timer.report_at(t0 + Duration::from_millis(600)).is_none());

        for i in 31..=60 {
            timer.tick_at(t0 + Duration::from_millis(i * 20));
        }
        let fps = timer.report_at(t0 + Duration::from_secs(2)).unwrap();
        assert!((fps - 30.0).abs() < 0.01);
        assert!(timer.report_at(t0 + Duration::from_secs(2)).is_none());
    }
}
