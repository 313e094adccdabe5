//! Sliding-window withdrawal detector shared by the live streaming loop and offline analysis.
//!
//! ## Algorithm
//!
//! Every call to [`MovingAverageTerminator::update`] appends one sample to a FIFO window of
//! `window` samples, keeping `running_sum` equal to the sum of the window's contents (add the new
//! sample, subtract the evicted one). Once the window is full, each new sample is compared with
//! `threshold * running_sum / window`:
//!
//! - a qualifying (lower) sample extends the current streak, the first sample of a streak becomes
//!   the candidate latency;
//! - a non-qualifying sample resets the streak and clears the candidate.
//!
//! A streak of [`CROSS_TIME`] qualifying samples latches termination. Termination is sticky:
//! the window keeps rolling afterwards but the candidate is frozen, so [`MovingAverageTerminator::latency`]
//! keeps reporting the onset of the confirming streak.
//!
//! The terminator works on plain `f64` samples, so the engine can feed raw device units and the
//! analyzer volts; the ratio test is scale invariant.

use std::collections::VecDeque;

/// Number of samples averaged (1 s at 1000 Hz).
pub const WINDOW_SIZE: usize = 1000;
/// Consecutive qualifying samples required to confirm termination.
pub const CROSS_TIME: usize = 20;
/// Default fraction of the moving average below which a sample qualifies.
pub const DEFAULT_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct MovingAverageTerminator {
    threshold: f64,
    window_size: usize,
    cross_time: usize,
    window: VecDeque<f64>,
    running_sum: f64,
    cross_count: usize,
    candidate: Option<usize>,
    terminated: bool,
    current_index: usize,
}

impl MovingAverageTerminator {
    /// A fresh terminator with the default window and debounce.
    pub fn new(threshold: f64) -> Self {
        Self::with_window(threshold, WINDOW_SIZE, CROSS_TIME)
    }

    /// Custom window and debounce, mainly for tests.
    ///
    /// Panics if either is zero.
    pub fn with_window(threshold: f64, window_size: usize, cross_time: usize) -> Self {
        assert!(
            window_size > 0 && cross_time > 0,
            "Window size and cross time must be positive, got {} and {}",
            window_size,
            cross_time
        );
        Self {
            threshold,
            window_size,
            cross_time,
            window: VecDeque::with_capacity(window_size),
            running_sum: 0.,
            cross_count: 0,
            candidate: None,
            terminated: false,
            current_index: 0,
        }
    }

    /// Feeds one sample. Returns `true` only on the call that newly latches termination.
    ///
    /// ```
    /// use stimcompiler_backend::terminator::*;
    ///
    /// let mut term = MovingAverageTerminator::with_window(0.9, 10, 3);
    /// let mut fired = vec![];
    /// for (i, x) in [1.; 10].into_iter().chain([0.; 5]).enumerate() {
    ///     if term.update(x) {
    ///         fired.push(i);
    ///     }
    /// }
    /// assert_eq!(fired, vec![12]);
    /// assert_eq!(term.latency(), Some(10));
    /// ```
    pub fn update(&mut self, sample: f64) -> bool {
        self.running_sum += sample;
        self.window.push_back(sample);

        let mut newly_terminated = false;
        if self.window.len() == self.window_size {
            let average = self.running_sum / self.window_size as f64;
            if !self.terminated {
                if sample < self.threshold * average {
                    if self.cross_count == 0 {
                        self.candidate = Some(self.current_index);
                    }
                    self.cross_count += 1;
                    if self.cross_count == self.cross_time {
                        self.terminated = true;
                        newly_terminated = true;
                    }
                } else {
                    self.cross_count = 0;
                    self.candidate = None;
                }
            }
            if let Some(evicted) = self.window.pop_front() {
                self.running_sum -= evicted;
            }
        }

        self.current_index += 1;
        newly_terminated
    }

    /// Index of the first sample of the current (or confirming) qualifying streak.
    pub fn latency(&self) -> Option<usize> {
        self.candidate
    }

    pub fn has_terminated(&self) -> bool {
        self.terminated
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Number of samples fed so far.
    pub fn samples_seen(&self) -> usize {
        self.current_index
    }

    /// Current streak length of qualifying samples.
    pub fn cross_count(&self) -> usize {
        self.cross_count
    }

    /// Average over the last `min(window, samples_seen)` samples.
    pub fn average(&self) -> Option<f64> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.running_sum / self.window.len() as f64)
        }
    }
}
