//! TOML run files for the command-line runner.
//!
//! ```toml
//! [device]
//! simulate = true
//! # Simulated withdrawal: red reads 2% of its level from frame 1200 on
//! response = [{ channel = 0, from_frame = 1200, gain = 0.02 }]
//!
//! [engine]
//! stall_timeout_ms = 500
//!
//! [calibration]
//! slope = 12.0
//! intercept = 0.1
//!
//! [[stimulus]]
//! threshold = 0.9
//! spec = { kind = "pulse", duration_ms = 500, blue_voltage = 2.0, red_voltage = 4.0 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stimcompiler_backend::calibration::PowerCalibration;
use stimcompiler_backend::error::{Result, StimError};
use stimcompiler_backend::waveform::StimLimits;

use crate::engine::StimulusEngine;
use crate::session::DeviceSession;
use crate::sim::SimulatedDevice;
use crate::worker::StimulusJob;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub calibration: Option<PowerCalibration>,
    #[serde(default, rename = "stimulus")]
    pub stimuli: Vec<StimulusJob>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Run against [`SimulatedDevice`] instead of hardware.
    #[serde(default)]
    pub simulate: bool,
    /// Index of the 1401 to open (hardware only).
    #[serde(default)]
    pub index: u16,
    /// Directory holding the 1401 command files (hardware only).
    pub command_dir: Option<String>,
    /// Simulated model string.
    pub descriptor: Option<String>,
    /// Simulated user memory.
    pub user_memory_bytes: Option<usize>,
    /// Simulated response profile.
    #[serde(default)]
    pub response: Vec<ResponseStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponseStep {
    pub channel: usize,
    pub from_frame: usize,
    pub gain: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub padding: Option<usize>,
    pub stall_timeout_ms: Option<u64>,
    pub max_voltage: Option<f64>,
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| StimError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StimError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Checks what can be checked without a device. Stimulus parameters are validated by the
    /// engine when each job runs.
    pub fn validate(&self) -> Result<()> {
        if self.engine.padding == Some(0) {
            return Err(StimError::Config("engine.padding must be at least 1".to_string()));
        }
        if let Some(max) = self.engine.max_voltage {
            if !(max.is_finite() && max > 0.) {
                return Err(StimError::Config(format!(
                    "engine.max_voltage must be positive, got {}",
                    max
                )));
            }
        }
        if let Some(step) = self.device.response.iter().find(|s| !s.gain.is_finite()) {
            return Err(StimError::Config(format!(
                "Response gain for channel {} must be finite",
                step.channel
            )));
        }
        Ok(())
    }

    /// Simulated device described by the `[device]` table.
    pub fn simulator(&self) -> SimulatedDevice {
        let mut dev = SimulatedDevice::new();
        if let Some(descriptor) = &self.device.descriptor {
            dev = dev.with_descriptor(descriptor);
        }
        if let Some(bytes) = self.device.user_memory_bytes {
            dev = dev.with_user_memory(bytes);
        }
        self.device.response.iter().fold(dev, |dev, step| {
            dev.with_response(step.channel, step.from_frame, step.gain)
        })
    }

    /// Applies the `[engine]` table.
    pub fn configure<S: DeviceSession>(&self, mut engine: StimulusEngine<S>) -> StimulusEngine<S> {
        if let Some(padding) = self.engine.padding {
            engine = engine.with_padding(padding);
        }
        if let Some(ms) = self.engine.stall_timeout_ms {
            engine = engine.with_stall_timeout(Duration::from_millis(ms));
        }
        if let Some(max_voltage) = self.engine.max_voltage {
            engine = engine.with_limits(StimLimits { max_voltage });
        }
        engine
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use stimcompiler_backend::error::FailureKind;
    use stimcompiler_backend::waveform::WaveformSpec;

    const RUN: &str = r#"
[device]
simulate = true
user_memory_bytes = 65536
response = [{ channel = 0, from_frame = 1200, gain = 0.02 }]

[engine]
stall_timeout_ms = 250

[calibration]
slope = 12.0
intercept = 0.1

[[stimulus]]
spec = { kind = "pulse", duration_ms = 500, blue_voltage = 2.0, red_voltage = 4.0 }

[[stimulus]]
threshold = 0.8
camera = { fps = 500.0, length_s = 2.0 }
spec = { kind = "pulse_train", pulse_length_ms = 20, blue_voltage = 1.0, red_voltage = 4.0, freq_hz = 5.0, num_pulses = 3 }
"#;

    #[test]
    fn parses_run_file() {
        let config = RunConfig::from_toml_str(RUN).unwrap();
        assert!(config.device.simulate);
        assert_eq!(config.engine.stall_timeout_ms, Some(250));
        assert_eq!(config.calibration, Some(PowerCalibration::new(12.0, 0.1)));
        assert_eq!(config.stimuli.len(), 2);
        assert_eq!(config.stimuli[0].threshold, 0.9);
        assert_eq!(
            config.stimuli[0].spec,
            WaveformSpec::Pulse {
                duration_ms: 500,
                blue_voltage: 2.0,
                red_voltage: 4.0
            }
        );
        assert_eq!(config.stimuli[1].camera.unwrap().fps, 500.0);
        assert_eq!(config.stimuli[1].spec.period_ms(), Some(200));
    }

    #[test]
    fn rejects_bad_files() {
        let err = RunConfig::from_toml_str("[device]\nsimulate = \"yes\"").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Config);
        assert!(RunConfig::from_toml_str("[engine]\npadding = 0").is_err());
        assert!(RunConfig::from_toml_str("[engine]\nturbo = true").is_err());
        assert!(RunConfig::from_toml_str(
            "[[stimulus]]\nspec = { kind = \"strobe\", duration_ms = 5 }"
        )
        .is_err());
    }

    #[test]
    fn hardware_command_directory() {
        let config = RunConfig::from_toml_str("[device]\nindex = 1\ncommand_dir = 'd:\\ced\\1401'").unwrap();
        assert_eq!(config.device.index, 1);
        assert_eq!(config.device.command_dir.as_deref(), Some(r"d:\ced\1401"));
        assert_eq!(RunConfig::from_toml_str("").unwrap().device.command_dir, None);
    }

    #[test]
    fn builds_configured_simulator() {
        let config = RunConfig::from_toml_str(RUN).unwrap();
        let engine = config.configure(StimulusEngine::open(config.simulator()).unwrap());
        assert_eq!(engine.device_info().user_memory_bytes, 65536);
        assert_eq!(engine.builder().padding(), stimcompiler_backend::waveform::PAD_LENGTH);
    }
}
