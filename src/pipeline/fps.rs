//! Delivered frame-rate monitor

use std::time::{Duration, Instant};

use tracing::debug;

pub struct FrameRateMonitor {
    interval: Duration,
    frames: u64,
    window_start: Instant,
    last_fps: f64,
}

impl FrameRateMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            frames: 0,
            window_start: Instant::now(),
            last_fps: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.frames = 0;
        self.window_start = Instant::now();
    }

    pub fn last_fps(&self) -> f64 {
        self.last_fps
    }

    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    /// Count one frame at `now`. Returns the rate when a window closes.
    pub fn tick_at(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }

        let fps = self.frames as f64 / elapsed.as_secs_f64();
        debug!("{:.2} fps over {} frames", fps, self.frames);
        metrics::gauge!("camhal_fps").set(fps);

        self.last_fps = fps;
        self.frames = 0;
        self.window_start = now;
        Some(fps)
    }
}
