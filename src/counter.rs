//! A small rolling throughput counter, used by the per-torrent persist loop
//! to report download/upload rates without keeping an unbounded history.

use std::time::{Duration, Instant};

/// The width of the sliding window over which the rate is averaged.
const WINDOW: Duration = Duration::from_millis(500);

/// Tracks bytes transferred over a short sliding window to produce a
/// reasonably current throughput estimate.
pub(crate) struct ThroughputCounter {
    /// Byte counts recorded since `window_start`.
    bytes_in_window: u64,
    /// When the current window started.
    window_start: Instant,
    /// The most recently computed rate, in bytes per second, held over until
    /// the next window closes.
    last_rate: f64,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self {
            bytes_in_window: 0,
            window_start: Instant::now(),
            last_rate: 0.0,
        }
    }

    /// Records that `bytes` were transferred just now.
    pub fn update(&mut self, bytes: u64) {
        self.roll_window_if_elapsed();
        self.bytes_in_window += bytes;
    }

    /// Returns the current throughput estimate, in bytes per second.
    pub fn rate(&mut self) -> f64 {
        self.roll_window_if_elapsed();
        self.last_rate
    }

    fn roll_window_if_elapsed(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= WINDOW {
            self.last_rate = self.bytes_in_window as f64 / elapsed.as_secs_f64();
            self.bytes_in_window = 0;
            self.window_start = Instant::now();
        }
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}
