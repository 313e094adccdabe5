//! # Stimulus control backend
//!
//! Hardware-facing half of the photostimulator backend, built on the `stimcompiler_backend`
//! crate. It streams compiled stimuli to a CED 1401, samples the photodiode and force inputs while
//! the stimulus plays, and cuts the stimulus short as soon as the red channel shows a withdrawal.
//!
//! ## Modules
//!
//! - [`session`]: the [`session::DeviceSession`] contract and its checked wrappers.
//! - [`command`]: the 1401 command strings (`memdac`, `adcmem`, `DIGTIM`, `DAC`, kill).
//! - [`engine`]: the [`engine::StimulusEngine`] state machine and streaming loop.
//! - [`worker`]: a background thread that owns the engine and serializes stimuli.
//! - [`sim`]: a simulated 1401 for tests and dry runs.
//! - [`config`]: TOML run files for the `stimctrl_backend_bin` runner.
//! - `use1401` (feature `ced1401`): the vendor library session.
//!
//! ## Example
//!
//! ```
//! use stimcompiler_backend::waveform::WaveformSpec;
//! use stimctrl_backend::engine::StimulusEngine;
//! use stimctrl_backend::sim::SimulatedDevice;
//!
//! let mut engine = StimulusEngine::open(SimulatedDevice::new()).unwrap().with_padding(100);
//! let spec = WaveformSpec::Pulse { duration_ms: 50, blue_voltage: 2.0, red_voltage: 4.0 };
//! let outcome = engine.execute(&spec, 0.9, None).unwrap();
//! assert_eq!(outcome.received["red"].len(), 250);
//! assert!(!outcome.has_terminated());
//! ```

pub mod command;
pub mod config;
pub mod engine;
pub mod session;
pub mod sim;
#[cfg(feature = "ced1401")]
pub mod use1401;
pub mod worker;

#[cfg(feature = "python")]
mod python {
    use numpy::IntoPyArray;
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use stimcompiler_backend::calibration::PowerCalibration;
    use stimcompiler_backend::spec_from_args;

    use crate::command::CameraTrigger;
    use crate::engine::StimulusEngine;
    use crate::session::DeviceSession;
    use crate::sim::SimulatedDevice;

    /// Python handle on an open 1401 (or the simulator) and its execution engine.
    #[pyclass]
    pub struct Photostimulator {
        engine: StimulusEngine<Box<dyn DeviceSession + Send>>,
        calibration: Option<PowerCalibration>,
        latency: Option<usize>,
    }

    #[pymethods]
    impl Photostimulator {
        /// Opens the 1401 number `index`, or the simulator when `simulate` is set.
        #[new]
        #[pyo3(signature = (simulate = false, index = 0))]
        pub fn new(simulate: bool, index: u16) -> PyResult<Self> {
            let session: Box<dyn DeviceSession + Send> = if simulate {
                Box::new(SimulatedDevice::new())
            } else {
                open_hardware(index)?
            };
            Ok(Self {
                engine: StimulusEngine::open(session)?,
                calibration: None,
                latency: None,
            })
        }

        /// Linear calibration used to report blue power in mW.
        pub fn set_calibration(&mut self, slope: f64, intercept: f64) {
            self.calibration = Some(PowerCalibration::new(slope, intercept));
        }

        /// Fits and installs a calibration from measured `(volts, milliwatts)` pairs.
        pub fn fit_calibration(&mut self, volts: Vec<f64>, milliwatts: Vec<f64>) -> PyResult<(f64, f64)> {
            let cal = PowerCalibration::fit(&volts, &milliwatts)?;
            self.calibration = Some(cal);
            Ok((cal.slope, cal.intercept))
        }

        pub fn set_dac(&mut self, channel: u8, voltage: f64) -> PyResult<()> {
            Ok(self.engine.set_dac(channel, voltage)?)
        }

        /// Runs one stimulus and returns a dict of received channels (numpy arrays, volts), plus
        /// `blue_mw` when calibrated.
        ///
        /// `voltages` is `[blue, red]` or `[green, laser, red]`; `hsv` is `(fps, length_s)`.
        #[pyo3(signature = (kind, duration_ms, voltages, threshold = 0.9, freq_hz = None, num_pulses = None, hsv = None))]
        pub fn execute(
            &mut self,
            py: Python,
            kind: &str,
            duration_ms: usize,
            voltages: Vec<f64>,
            threshold: f64,
            freq_hz: Option<f64>,
            num_pulses: Option<usize>,
            hsv: Option<(f64, f64)>,
        ) -> PyResult<PyObject> {
            let spec = spec_from_args(kind, duration_ms, &voltages, freq_hz, num_pulses)?;
            let camera = hsv.map(|(fps, length_s)| CameraTrigger::new(fps, length_s)).transpose()?;
            let outcome = self.engine.execute(&spec, threshold, camera.as_ref())?;
            self.latency = outcome.latency();

            let dict = PyDict::new(py);
            for (name, signal) in outcome.received.iter().chain(outcome.commanded.iter()) {
                dict.set_item(name, signal.clone().into_pyarray(py))?;
            }
            if self.calibration.is_some() && outcome.received.contains_key("blue") {
                let power = outcome.stimulus_power(self.calibration.as_ref())?;
                dict.set_item("blue_mw", power.into_pyarray(py))?;
            }
            Ok(dict.to_object(py))
        }

        /// Onset frame of the last detected withdrawal, `None` if the last stimulus ran to completion.
        pub fn latency(&self) -> Option<usize> {
            self.latency
        }

        pub fn state(&self) -> String {
            format!("{:?}", self.engine.state())
        }
    }

    #[cfg(feature = "ced1401")]
    fn open_hardware(index: u16) -> PyResult<Box<dyn DeviceSession + Send>> {
        Ok(Box::new(crate::use1401::Ced1401Session::open(index)?))
    }

    #[cfg(not(feature = "ced1401"))]
    fn open_hardware(_index: u16) -> PyResult<Box<dyn DeviceSession + Send>> {
        Err(pyo3::exceptions::PyRuntimeError::new_err(
            "stimctrl_backend was built without the `ced1401` feature",
        ))
    }

    #[pymodule]
    fn stimctrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<Photostimulator>()?;
        Ok(())
    }
}
