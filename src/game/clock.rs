//! Authoritative Match Clock
//!
//! Counts a match down in 100 ms steps. The event loop awaits `next_tick`
//! and calls `advance`; when `advance` reports expiry the loop starts the
//! intermission.

use std::time::Duration;

use crate::core::timer::Ticker;

/// Clock resolution.
pub const CLOCK_TICK: Duration = Duration::from_millis(100);

/// Pausable countdown driving one match.
#[derive(Debug)]
pub struct Clock {
    duration: Duration,
    time_left: Duration,
    paused: bool,
    running: bool,
    ticker: Ticker,
}

impl Clock {
    /// Create a stopped clock for a match of `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            time_left: duration,
            paused: false,
            running: false,
            ticker: Ticker::stopped(CLOCK_TICK),
        }
    }

    /// Match length.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time remaining.
    pub fn time_left(&self) -> Duration {
        self.time_left
    }

    /// Match time played so far. Frozen while paused.
    pub fn elapsed(&self) -> Duration {
        self.duration.saturating_sub(self.time_left)
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True between `start` and expiry or `stop`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start counting down from the full duration.
    pub fn start(&mut self) {
        self.time_left = self.duration;
        self.running = true;
        self.paused = false;
        self.ticker = Ticker::new(CLOCK_TICK);
    }

    /// Freeze the countdown.
    pub fn pause(&mut self) {
        if !self.running || self.paused {
            return;
        }
        self.paused = true;
        self.ticker.pause();
    }

    /// Continue the countdown.
    pub fn resume(&mut self) {
        if !self.running || !self.paused {
            return;
        }
        self.paused = false;
        self.ticker.resume();
    }

    /// Stop for good.
    pub fn stop(&mut self) {
        self.running = false;
        self.paused = false;
        self.ticker.stop();
    }

    /// Wait for the next tick. Pends while paused or stopped.
    pub async fn next_tick(&mut self) {
        self.ticker.tick().await;
    }

    /// Count one tick down. Returns true exactly once, when the clock
    /// reaches zero; the clock is stopped at that point.
    pub fn advance(&mut self) -> bool {
        if !self.running || self.paused {
            return false;
        }
        self.time_left = self.time_left.saturating_sub(CLOCK_TICK);
        if self.time_left.is_zero() {
            self.stop();
            return true;
        }
        false
    }
}
