//! Linear volts to milliwatts mapping for the blue LED.
//!
//! Calibration is measured by stepping the blue DAC through a set of voltages with a power meter
//! at the sample plane, then fitting a first-degree polynomial. It is optional everywhere: callers
//! that ask for milliwatt output without one get [`StimError::CalibrationMissing`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, StimError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerCalibration {
    pub slope: f64,
    pub intercept: f64,
}

impl PowerCalibration {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    /// Least-squares line through `(volts[i], milliwatts[i])`.
    ///
    /// Needs at least two distinct voltages.
    ///
    /// ```
    /// use stimcompiler_backend::calibration::PowerCalibration;
    /// let cal = PowerCalibration::fit(&[0.0, 1.0, 2.0], &[0.5, 2.5, 4.5]).unwrap();
    /// assert!((cal.slope - 2.0).abs() < 1e-12);
    /// assert!((cal.intercept - 0.5).abs() < 1e-12);
    /// ```
    pub fn fit(volts: &[f64], milliwatts: &[f64]) -> Result<Self> {
        if volts.len() != milliwatts.len() {
            return Err(StimError::Validation(format!(
                "Calibration needs paired samples, got {} voltages and {} powers",
                volts.len(),
                milliwatts.len()
            )));
        }
        if volts.iter().chain(milliwatts).any(|x| !x.is_finite()) {
            return Err(StimError::Validation(
                "Calibration samples must be finite".to_string(),
            ));
        }
        let n = volts.len() as f64;
        let mean_v = volts.iter().sum::<f64>() / n;
        let mean_p = milliwatts.iter().sum::<f64>() / n;
        let (sxy, sxx) = volts
            .iter()
            .zip(milliwatts)
            .fold((0., 0.), |(sxy, sxx), (&v, &p)| {
                (sxy + (v - mean_v) * (p - mean_p), sxx + (v - mean_v).powi(2))
            });
        if volts.len() < 2 || sxx == 0. {
            return Err(StimError::Validation(
                "Calibration needs at least two distinct voltages".to_string(),
            ));
        }
        let slope = sxy / sxx;
        Ok(Self {
            slope,
            intercept: mean_p - slope * mean_v,
        })
    }

    pub fn to_milliwatts(&self, volts: f64) -> f64 {
        self.slope * volts + self.intercept
    }

    pub fn to_volts(&self, milliwatts: f64) -> Result<f64> {
        if self.slope == 0. {
            return Err(StimError::Validation(
                "Calibration slope is zero, power cannot be inverted".to_string(),
            ));
        }
        Ok((milliwatts - self.intercept) / self.slope)
    }
}

/// Resolves an optional calibration, failing when milliwatts were requested without one.
pub fn require(calibration: Option<&PowerCalibration>) -> Result<&PowerCalibration> {
    calibration.ok_or(StimError::CalibrationMissing)
}
