//! Pausable Ticker and Timers
//!
//! Game time in Cube is not wall time: a match clock stops while the game is
//! paused, and so do the timers hanging off it (flag resets, countdowns).
//! These primitives wrap `tokio::time` with pause/resume/stop.
//!
//! ```text
//!   Ticker:  tick ─ tick ─ tick ─ [paused .........] ─ tick ─ tick ─ [stop]
//!   Timer:   |────── remaining ──────|pause|─ remaining ─|fire
//! ```
//!
//! All deadlines use `tokio::time::Instant` so tests can drive them with a
//! paused runtime clock.

use std::collections::BTreeMap;
use std::future::pending;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

// =============================================================================
// TICKER
// =============================================================================

/// Periodic tick source that can be paused, resumed and stopped.
///
/// While paused or stopped `tick` never completes, so a paused ticker simply
/// drops the ticks it would have produced.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
    paused: bool,
    stopped: bool,
}

impl Ticker {
    /// Create a running ticker whose first tick is one period from now.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
            paused: false,
            stopped: false,
        }
    }

    /// Create a ticker that has not been started.
    pub fn stopped(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
            paused: false,
            stopped: true,
        }
    }

    /// Tick interval.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Suspend tick delivery.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume tick delivery, one full period from now.
    pub fn resume(&mut self) {
        if self.stopped || !self.paused {
            return;
        }
        self.paused = false;
        self.next = Instant::now() + self.period;
    }

    /// Stop for good. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True once stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Wait for the next tick. Cancel safe.
    pub async fn tick(&mut self) {
        if self.paused || self.stopped {
            pending::<()>().await;
        }
        sleep_until(self.next).await;
        self.next += self.period;
    }
}

// =============================================================================
// TIMER
// =============================================================================

/// One-shot timer with pause/resume and `time_left` tracking.
#[derive(Debug, Clone)]
pub struct Timer {
    remaining: Duration,
    deadline: Option<Instant>,
    stopped: bool,
}

impl Timer {
    /// Start a timer firing after `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            remaining: duration,
            deadline: Some(Instant::now() + duration),
            stopped: false,
        }
    }

    /// Freeze the remaining time.
    pub fn pause(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            self.remaining = deadline.saturating_duration_since(Instant::now());
        }
    }

    /// Restart the countdown from the frozen remaining time.
    pub fn resume(&mut self) {
        if self.stopped || self.deadline.is_some() {
            return;
        }
        self.deadline = Some(Instant::now() + self.remaining);
    }

    /// Cancel. A stopped timer never fires.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.deadline = None;
    }

    /// True while paused (and not stopped).
    pub fn is_paused(&self) -> bool {
        !self.stopped && self.deadline.is_none()
    }

    /// Time until the timer fires.
    pub fn time_left(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None if self.stopped => Duration::ZERO,
            None => self.remaining,
        }
    }

    /// Deadline while running.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True if running and the deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| d <= now)
    }
}

// =============================================================================
// TIMER QUEUE
// =============================================================================

/// Keyed set of timers owned by the event loop.
///
/// Scheduling a key that already exists replaces its timer.
#[derive(Debug)]
pub struct TimerQueue<K: Ord + Clone> {
    timers: BTreeMap<K, Timer>,
}

impl<K: Ord + Clone> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            timers: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> TimerQueue<K> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` to fire after `after`.
    pub fn schedule(&mut self, key: K, after: Duration) {
        self.timers.insert(key, Timer::new(after));
    }

    /// Remove a timer. Returns true if it was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.timers.remove(key).is_some()
    }

    /// Remove every timer matching `pred`.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&K) -> bool) {
        self.timers.retain(|k, _| !pred(k));
    }

    /// True if `key` is pending.
    pub fn contains(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    /// Remaining time for `key`.
    pub fn time_left(&self, key: &K) -> Option<Duration> {
        self.timers.get(key).map(Timer::time_left)
    }

    /// True if `key` is pending but paused.
    pub fn is_paused(&self, key: &K) -> bool {
        self.timers.get(key).map_or(false, Timer::is_paused)
    }

    /// Pause every timer matching `pred`.
    pub fn pause_where(&mut self, mut pred: impl FnMut(&K) -> bool) {
        for (k, t) in self.timers.iter_mut() {
            if pred(k) {
                t.pause();
            }
        }
    }

    /// Resume every timer matching `pred`.
    pub fn resume_where(&mut self, mut pred: impl FnMut(&K) -> bool) {
        for (k, t) in self.timers.iter_mut() {
            if pred(k) {
                t.resume();
            }
        }
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest running deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().filter_map(Timer::deadline).min()
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.is_expired(now))
            .filter_map(|(k, t)| t.deadline().map(|d| (d, k.clone())))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, k) in &due {
            self.timers.remove(k);
        }
        due.into_iter().map(|(_, k)| k).collect()
    }

    /// Sleep until the earliest running deadline. Pends forever when nothing
    /// is running.
    pub async fn next_expiry(&self) {
        match self.next_deadline() {
            Some(deadline) => sleep_until(deadline).await,
            None => pending::<()>().await,
        }
    }
}
