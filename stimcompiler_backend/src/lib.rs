//! # Stimulus compiler backend
//!
//! Hardware-independent half of the photostimulator backend. A stimulus is requested as a
//! [`waveform::WaveformSpec`] in physical units; this crate validates it, compiles it to the 16-bit
//! interleaved buffer a CED 1401 plays back, and provides the withdrawal detector used both while
//! streaming (see the `stimctrl_backend` crate) and for offline analysis.
//!
//! ## Modules
//!
//! - [`instruction`] and [`channel`]: waveform segments and the channels assembled from them.
//! - [`waveform`]: stimulus kinds, validation and the [`waveform::WaveformBuilder`].
//! - [`units`]: voltage to device unit conversion.
//! - [`terminator`]: the moving-average withdrawal detector.
//! - [`latency`]: offline replay of recorded traces through the detector.
//! - [`calibration`]: optional volts to milliwatts mapping for the blue LED.
//! - [`error`]: the [`error::StimError`] taxonomy shared by both crates.
//!
//! ## Example
//!
//! ```
//! use stimcompiler_backend::*;
//!
//! let builder = WaveformBuilder::new(UnitConverter::new(VoltageRange::Five));
//! let spec = WaveformSpec::Ramp { duration_ms: 5000, blue_voltage: 3.0, red_voltage: 4.0 };
//! let wave = builder.build(&spec).unwrap();
//! assert_eq!(wave.channel_count(), 2);
//! assert_eq!(wave.interleaved.len(), 2 * (5000 + 2 * PAD_LENGTH));
//! ```

pub mod calibration;
pub mod channel;
pub mod error;
pub mod instruction;
pub mod latency;
pub mod terminator;
pub mod units;
pub mod utils;
pub mod waveform;

pub use calibration::*;
pub use channel::*;
pub use error::{FailureKind, StimError};
pub use instruction::*;
pub use latency::*;
pub use terminator::*;
pub use units::*;
pub use utils::*;
pub use waveform::*;

#[cfg(feature = "python")]
mod python {
    use numpy::{IntoPyArray, PyReadonlyArray1};
    use pyo3::prelude::*;

    use crate::error::Result;
    use crate::*;

    /// Offline latency of a recorded red trace, `None` if no withdrawal was detected.
    #[pyfunction]
    #[pyo3(signature = (array, threshold = 0.9))]
    fn analyze_latency(array: PyReadonlyArray1<f64>, threshold: f64) -> PyResult<Option<usize>> {
        Ok(LatencyAnalyzer::new(threshold).analyze(array.as_array())?)
    }

    /// Renders a stimulus in volts without a device (red soft start and stop).
    #[pyfunction]
    #[pyo3(signature = (kind, duration_ms, voltages, freq_hz = None, num_pulses = None, padding = PAD_LENGTH))]
    fn preview_waveform(
        py: Python,
        kind: &str,
        duration_ms: usize,
        voltages: Vec<f64>,
        freq_hz: Option<f64>,
        num_pulses: Option<usize>,
        padding: usize,
    ) -> PyResult<PyObject> {
        let spec = spec_from_args(kind, duration_ms, &voltages, freq_hz, num_pulses)?;
        let builder = WaveformBuilder::new(UnitConverter::new(VoltageRange::Five)).with_padding(padding);
        let arr = builder.preview(&spec)?;
        Ok(arr.into_pyarray(py).to_object(py))
    }

    /// Maps positional Python arguments to a [`WaveformSpec`].
    ///
    /// Voltages are `[blue, red]` for two-channel kinds and `[green, laser, red]` otherwise.
    pub fn spec_from_args(
        kind: &str,
        duration_ms: usize,
        voltages: &[f64],
        freq_hz: Option<f64>,
        num_pulses: Option<usize>,
    ) -> Result<WaveformSpec> {
        let bad = |msg: &str| StimError::Validation(format!("{}: {}", kind, msg));
        match (kind, voltages) {
            ("ramp", &[blue_voltage, red_voltage]) => Ok(WaveformSpec::Ramp {
                duration_ms,
                blue_voltage,
                red_voltage,
            }),
            ("pulse", &[blue_voltage, red_voltage]) => Ok(WaveformSpec::Pulse {
                duration_ms,
                blue_voltage,
                red_voltage,
            }),
            ("pulse_train", &[blue_voltage, red_voltage]) => Ok(WaveformSpec::PulseTrain {
                pulse_length_ms: duration_ms,
                blue_voltage,
                red_voltage,
                freq_hz: freq_hz.ok_or_else(|| bad("missing freq_hz"))?,
                num_pulses: num_pulses.ok_or_else(|| bad("missing num_pulses"))?,
            }),
            ("red_green_laser", &[green_voltage, laser_voltage, red_voltage]) => {
                Ok(WaveformSpec::RedGreenLaser {
                    duration_ms,
                    green_voltage,
                    laser_voltage,
                    red_voltage,
                })
            }
            _ => Err(bad("unknown kind or wrong number of voltages")),
        }
    }

    #[pymodule]
    fn stimcompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(analyze_latency, m)?)?;
        m.add_function(wrap_pyfunction!(preview_waveform, m)?)?;
        Ok(())
    }
}

#[cfg(feature = "python")]
pub use python::spec_from_args;
