//! Offline withdrawal latency analysis.
//!
//! Replays a fully received channel through a fresh [`MovingAverageTerminator`], the same
//! implementation the streaming loop uses, so the live abort decision and the post-hoc latency
//! never drift apart.

use ndarray::{Array1, ArrayView1};

use crate::calibration::{self, PowerCalibration};
use crate::error::{Result, StimError};
use crate::terminator::*;
use crate::waveform::PAD_LENGTH;

/// Replays `samples` with the default window and returns the detected onset index.
///
/// Replay stops at the first termination; `None` if none occurs.
///
/// ```
/// use stimcompiler_backend::latency::analyze_latency;
/// let mut red = vec![4.0; 3000];
/// red.extend(vec![0.1; 100]);
/// assert_eq!(analyze_latency(&red, 0.9), Some(3000));
/// assert_eq!(analyze_latency(&red[..3000], 0.9), None);
/// ```
pub fn analyze_latency(samples: &[f64], threshold: f64) -> Option<usize> {
    replay(
        samples.iter().copied(),
        MovingAverageTerminator::new(threshold),
    )
}

fn replay(samples: impl Iterator<Item = f64>, mut term: MovingAverageTerminator) -> Option<usize> {
    for sample in samples {
        term.update(sample);
        if term.has_terminated() {
            break;
        }
    }
    term.latency()
}

/// Configurable analyzer for recorded trials.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyAnalyzer {
    pub threshold: f64,
    /// Samples of rest before stimulus onset in the analyzed recordings.
    pub padding: usize,
    pub window_size: usize,
    pub cross_time: usize,
}

impl Default for LatencyAnalyzer {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            padding: PAD_LENGTH,
            window_size: WINDOW_SIZE,
            cross_time: CROSS_TIME,
        }
    }
}

impl LatencyAnalyzer {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_window(mut self, window_size: usize, cross_time: usize) -> Self {
        self.window_size = window_size;
        self.cross_time = cross_time;
        self
    }

    /// Threshold must be in `(0, 1]`, window and cross time positive.
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0. && self.threshold <= 1.) {
            return Err(StimError::Validation(format!(
                "Threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.window_size == 0 || self.cross_time == 0 {
            return Err(StimError::Validation(format!(
                "Window size and cross time must be positive, got {} and {}",
                self.window_size, self.cross_time
            )));
        }
        Ok(())
    }

    /// Sample index of the detected withdrawal onset.
    pub fn analyze(&self, samples: ArrayView1<f64>) -> Result<Option<usize>> {
        self.validate()?;
        Ok(replay(
            samples.iter().copied(),
            MovingAverageTerminator::with_window(self.threshold, self.window_size, self.cross_time),
        ))
    }

    /// Latency in ms after stimulus onset. Negative when the response preceded the stimulus.
    pub fn relative_to_onset(&self, samples: ArrayView1<f64>) -> Result<Option<i64>> {
        Ok(self
            .analyze(samples)?
            .map(|idx| idx as i64 - self.padding as i64))
    }

    /// Analyzes independent trials, one result per trial in order.
    pub fn analyze_batch<'a, I>(&self, trials: I) -> Result<Vec<Option<usize>>>
    where
        I: IntoIterator<Item = ArrayView1<'a, f64>>,
    {
        trials.into_iter().map(|trial| self.analyze(trial)).collect()
    }

    /// Converts a received blue trace (volts) to milliwatts.
    pub fn stimulus_power(
        &self,
        blue: ArrayView1<f64>,
        calibration: Option<&PowerCalibration>,
    ) -> Result<Array1<f64>> {
        let cal = calibration::require(calibration)?;
        Ok(blue.mapv(|v| cal.to_milliwatts(v)))
    }

    /// Blue power (mW) delivered at the detected withdrawal onset, the ramp threshold measure.
    ///
    /// `Ok(None)` when no withdrawal was detected.
    pub fn power_at_withdrawal(
        &self,
        red: ArrayView1<f64>,
        blue: ArrayView1<f64>,
        calibration: Option<&PowerCalibration>,
    ) -> Result<Option<f64>> {
        let cal = calibration::require(calibration)?;
        Ok(self
            .analyze(red)?
            .and_then(|idx| blue.get(idx).copied())
            .map(|v| cal.to_milliwatts(v)))
    }
}

#[cfg(test)]
mod test {
    use ndarray::Array1;

    use crate::error::FailureKind;
    use crate::latency::*;

    fn trial(drop_at: usize, len: usize) -> Array1<f64> {
        Array1::from_iter((0..len).map(|i| if i < drop_at { 4.0 } else { 0.05 }))
    }

    #[test]
    fn replay_is_deterministic() {
        let analyzer = LatencyAnalyzer::default();
        let red = trial(2500, 4000);
        let first = analyzer.analyze(red.view()).unwrap();
        let second = analyzer.analyze(red.view()).unwrap();
        assert_eq!(first, Some(2500));
        assert_eq!(first, second);
        assert_eq!(analyzer.relative_to_onset(red.view()).unwrap(), Some(500));
    }

    #[test]
    fn batch_keeps_trial_order() {
        let analyzer = LatencyAnalyzer::new(0.9).with_padding(100).with_window(50, 5);
        let trials = [trial(300, 500), trial(1000, 500), trial(120, 500)];
        let results = analyzer.analyze_batch(trials.iter().map(|t| t.view())).unwrap();
        assert_eq!(results, vec![Some(300), None, Some(120)]);
        assert_eq!(analyzer.relative_to_onset(trials[2].view()).unwrap(), Some(20));
    }

    #[test]
    fn matches_free_function() {
        let red = trial(1800, 2500);
        assert_eq!(
            analyze_latency(red.as_slice().unwrap(), 0.9),
            LatencyAnalyzer::new(0.9).analyze(red.view()).unwrap()
        );
    }

    #[test]
    fn bad_settings_are_rejected() {
        let red = trial(100, 200);
        for analyzer in [
            LatencyAnalyzer::default().with_window(0, 20),
            LatencyAnalyzer::default().with_window(50, 0),
            LatencyAnalyzer::new(0.),
            LatencyAnalyzer::new(1.5),
            LatencyAnalyzer::new(f64::NAN),
        ] {
            let err = analyzer.analyze(red.view()).unwrap_err();
            assert_eq!(err.kind(), FailureKind::Validation, "{:?}", analyzer);
        }
        let batch = LatencyAnalyzer::default().with_window(0, 5);
        assert!(batch.analyze_batch([red.view()]).is_err());
        let cal = PowerCalibration::new(10., 1.);
        assert!(batch.power_at_withdrawal(red.view(), red.view(), Some(&cal)).is_err());
    }

    #[test]
    fn power_requires_calibration() {
        let analyzer = LatencyAnalyzer::new(0.9).with_window(50, 5);
        let red = trial(100, 200);
        let blue = Array1::linspace(0., 2., 200);
        let err = analyzer
            .power_at_withdrawal(red.view(), blue.view(), None)
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::CalibrationMissing);

        let cal = PowerCalibration::new(10., 1.);
        let mw = analyzer
            .power_at_withdrawal(red.view(), blue.view(), Some(&cal))
            .unwrap()
            .unwrap();
        assert!((mw - cal.to_milliwatts(blue[100])).abs() < 1e-12);
        let power = analyzer.stimulus_power(blue.view(), Some(&cal)).unwrap();
        assert_eq!(power[0], 1.);
    }
}
