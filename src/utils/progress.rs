use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Trailing window used for the instantaneous speed
pub const SPEED_WINDOW: Duration = Duration::from_secs(2);

/// Speed values kept for the display scale
pub const HISTORY_LEN: usize = 64;

/// Below this rate the remaining time is unknown
pub const SPEED_NOISE_FLOOR: f64 = 100.0;

const PAUSE_BACKOFF_START: Duration = Duration::from_millis(10);

/// Counters shared between the streaming thread and the UI
///
/// Each field is a separate atomic; readers may see `completed` and `total`
/// from neighbouring ticks but never a torn value.
#[derive(Debug, Default)]
pub struct TransferState {
    completed: AtomicU64,
    total: AtomicU64,
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl TransferState {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn store(&self, completed: u64, total: u64) {
        // total never moves down within one operation
        self.total.fetch_max(total.max(completed), Ordering::Relaxed);
        self.completed.store(completed, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    bytes: u64,
    at: Instant,
}

/// Throughput over a sliding window plus a smoothed display ceiling
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,
    history: VecDeque<f64>,
    speed: f64,
    ceiling: f64,
    completed: u64,
    total: u64,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
            speed: 0.0,
            ceiling: 0.0,
            completed: 0,
            total: 0,
        }
    }

    /// Feed one progress tick observed at `now`
    ///
    /// # Behavior
    /// - Samples older than the window are dropped, keeping at least one
    /// - Speed is recomputed only when two samples span a positive interval;
    ///   otherwise the previous value stands
    /// - The ceiling jumps to 110% of a new peak and otherwise eases towards
    ///   the recent peak by 1% per tick
    pub fn record(&mut self, completed: u64, total: u64, now: Instant) {
        self.completed = completed;
        self.total = self.total.max(total);

        self.samples.push_back(SpeedSample { bytes: completed, at: now });
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some(oldest) if now.saturating_duration_since(oldest.at) > SPEED_WINDOW => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        if let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) {
            let elapsed = last.at.saturating_duration_since(first.at).as_secs_f64();
            if self.samples.len() >= 2 && elapsed > 0.0 {
                self.speed = last.bytes.saturating_sub(first.bytes) as f64 / elapsed;
            }
        }

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(self.speed);

        let peak = self.history.iter().copied().fold(0.0, f64::max);
        if peak > self.ceiling {
            self.ceiling = peak * 1.1;
        } else {
            self.ceiling = self.ceiling * 0.99 + peak * 0.01;
        }
    }

    /// Bytes per second
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Upper bound for a speed graph
    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }

    /// `None` while the speed is too low to extrapolate
    pub fn remaining(&self) -> Option<Duration> {
        if self.speed <= SPEED_NOISE_FLOOR {
            return None;
        }
        let left = self.total.saturating_sub(self.completed) as f64;
        Some(Duration::from_secs_f64(left / self.speed))
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view for progress displays
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub total: u64,
    pub speed: f64,
    pub ceiling: f64,
    #[serde(skip)]
    pub remaining: Option<Duration>,
    pub paused: bool,
    pub cancelled: bool,
}

impl ProgressSnapshot {
    /// Fraction done in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.completed as f64 / self.total as f64).min(1.0)
        }
    }
}

/// Progress sink for one transfer, shared with a monitor through `Arc`
///
/// The streaming side calls [`ProgressTracker::on_progress`]; any other
/// thread may pause, resume or cancel and read snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    state: TransferState,
    speed: Mutex<SpeedTracker>,
    pause_poll: Duration,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_pause_poll(Duration::from_millis(100))
    }

    /// `pause_poll` caps the sleep between checks while paused
    pub fn with_pause_poll(pause_poll: Duration) -> Self {
        Self {
            state: TransferState::default(),
            speed: Mutex::new(SpeedTracker::new()),
            pause_poll: pause_poll.max(PAUSE_BACKOFF_START),
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Record a tick; blocks while paused
    ///
    /// # Returns
    /// * `true` - Keep streaming
    /// * `false` - The transfer was cancelled
    pub fn on_progress(&self, completed: u64, total: u64) -> bool {
        self.record_at(completed, total, Instant::now());

        let mut backoff = PAUSE_BACKOFF_START;
        while self.state.is_paused() && !self.state.is_cancelled() {
            thread::sleep(backoff);
            backoff = (backoff * 2).min(self.pause_poll);
        }

        !self.state.is_cancelled()
    }

    /// Record a tick with an explicit timestamp, without pausing
    pub fn record_at(&self, completed: u64, total: u64, now: Instant) {
        self.state.store(completed, total);
        if let Ok(mut speed) = self.speed.lock() {
            speed.record(completed, self.state.total(), now);
        }
    }

    pub fn cancel(&self) {
        tracing::info!("transfer cancel requested");
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
    }

    /// Flip pause; returns the new paused state
    pub fn toggle_pause(&self) -> bool {
        !self.state.paused.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let (speed, ceiling, remaining) = match self.speed.lock() {
            Ok(tracker) => (tracker.speed(), tracker.ceiling(), tracker.remaining()),
            Err(_) => (0.0, 0.0, None),
        };
        ProgressSnapshot {
            completed: self.state.completed(),
            total: self.state.total(),
            speed,
            ceiling,
            remaining,
            paused: self.state.is_paused(),
            cancelled: self.state.is_cancelled(),
        }
    }

    /// Clear counters and flags before the next transfer
    pub fn reset(&self) {
        self.state.completed.store(0, Ordering::Relaxed);
        self.state.total.store(0, Ordering::Relaxed);
        self.state.cancelled.store(false, Ordering::SeqCst);
        self.state.paused.store(false, Ordering::SeqCst);
        if let Ok(mut speed) = self.speed.lock() {
            *speed = SpeedTracker::new();
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_speed_over_one_second() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new();
        tracker.record(0, 100, start);
        assert_eq!(tracker.speed(), 0.0);
        tracker.record(50, 100, start + Duration::from_secs(1));
        assert!((tracker.speed() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_speed_kept_without_elapsed_time() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new();
        tracker.record(0, 1000, start);
        tracker.record(500, 1000, start + Duration::from_secs(1));
        // a lone sample after a stall keeps the last computed speed
        tracker.record(600, 1000, start + Duration::from_secs(6));
        assert!((tracker.speed() - 500.0).abs() < 0.01);
    }

    #[test]
    fn test_window_evicts_old_samples() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new();
        tracker.record(0, 10_000, start);
        tracker.record(1000, 10_000, start + Duration::from_secs(1));
        // only the samples at 4s and 5s remain
        tracker.record(1100, 10_000, start + Duration::from_secs(4));
        assert_eq!(tracker.samples.len(), 1);
        tracker.record(1400, 10_000, start + Duration::from_secs(5));
        assert!((tracker.speed() - 300.0).abs() < 0.01);
    }

    #[test]
    fn test_remaining_needs_meaningful_speed() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new();
        tracker.record(0, 1000, start);
        tracker.record(50, 1000, start + Duration::from_secs(1));
        assert_eq!(tracker.remaining(), None);

        tracker.record(450, 1000, start + Duration::from_secs(2));
        let remaining = tracker.remaining().unwrap();
        assert!((remaining.as_secs_f64() - 550.0 / 225.0).abs() < 0.01);
    }

    #[test]
    fn test_ceiling_snaps_up_and_decays() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new();
        tracker.record(0, 0, start);
        tracker.record(1000, 0, start + Duration::from_secs(1));
        assert!((tracker.ceiling() - 1100.0).abs() < 0.01);

        let before = tracker.ceiling();
        tracker.record(1000, 0, start + Duration::from_millis(1500));
        assert!(tracker.ceiling() < before);
        assert!(tracker.ceiling() > 1000.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new();
        for i in 0..200u64 {
            tracker.record(i * 10, 2000, start + Duration::from_millis(i * 10));
        }
        assert_eq!(tracker.history().count(), HISTORY_LEN);
    }

    #[test]
    fn test_total_never_decreases() {
        let tracker = ProgressTracker::new();
        tracker.record_at(10, 100, Instant::now());
        tracker.record_at(20, 50, Instant::now());
        assert_eq!(tracker.state().total(), 100);
        tracker.record_at(150, 100, Instant::now());
        assert_eq!(tracker.state().total(), 150);
    }

    #[test]
    fn test_cancel_stops_sink() {
        let tracker = ProgressTracker::new();
        assert!(tracker.on_progress(1, 10));
        tracker.cancel();
        assert!(!tracker.on_progress(2, 10));
        assert!(tracker.snapshot().cancelled);

        tracker.reset();
        assert!(!tracker.is_cancelled());
        assert_eq!(tracker.snapshot().completed, 0);
    }

    #[test]
    fn test_cancel_while_paused_wakes_sink() {
        let tracker = Arc::new(ProgressTracker::with_pause_poll(Duration::from_millis(20)));
        tracker.pause();

        let worker = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.on_progress(5, 10))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());
        tracker.cancel();
        assert!(!worker.join().unwrap());
    }

    #[test]
    fn test_resume_releases_sink() {
        let tracker = Arc::new(ProgressTracker::with_pause_poll(Duration::from_millis(20)));
        assert!(tracker.toggle_pause());

        let worker = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.on_progress(5, 10))
        };
        thread::sleep(Duration::from_millis(30));
        tracker.resume();
        assert!(worker.join().unwrap());
        assert!(!tracker.is_paused());
    }

    #[test]
    fn test_snapshot_fraction() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.snapshot().fraction(), 0.0);
        tracker.record_at(25, 100, Instant::now());
        assert!((tracker.snapshot().fraction() - 0.25).abs() < f64::EPSILON);
    }
}
