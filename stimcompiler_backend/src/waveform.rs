//! Stimulus waveform specifications, their validation, and compilation to device buffers.
//!
//! ## Overview
//!
//! A [`WaveformSpec`] describes one stimulus request in physical units (milliseconds and volts).
//! The [`WaveformBuilder`] validates it against [`StimLimits`], lays every output channel out as a
//! [`Channel`] of [`Instruction`]s, renders the channels and converts them to device units. The
//! result, a [`CompiledWaveform`], carries the interleaved buffer that is written to the 1401's
//! memory and the sizing of the input region the engine samples into.
//!
//! ## Channel layout
//!
//! Output channels are ordered as the 1401 DAC ports: red on port 0, then blue (two-channel
//! kinds) or green and laser (three-channel kind). Red is the "always on" light: it spans the
//! stimulus plus `padding` samples on each side, while the stimulus channels rest at 0 V during
//! the padding.
//!
//! | kind | red | stimulus channel(s) |
//! |---|---|---|
//! | Ramp | plateau, `duration + 2*padding` | `[0]` then a ramp ending at the target after `duration` samples, `padding - 1` zeros before, `padding` after |
//! | Pulse | plateau | plateau of `duration`, `padding` zeros on both sides |
//! | PulseTrain | plateau over the whole train | `num_pulses` pulses, one per period, `padding` zeros on both sides |
//! | RedGreenLaser | plateau | green and laser plateaus of `duration`, `padding` zeros on both sides |
//!
//! The asymmetric ramp padding is intentional: the ramp's leading zero sample takes the place of
//! the last padding sample.

use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::channel::*;
use crate::error::{Result, StimError};
use crate::instruction::*;
use crate::units::UnitConverter;

/// Fixed stimulus sampling rate: one sample per millisecond.
pub const SAMPLING_RATE: f64 = 1000.;
/// Rest period before and after the stimulus (2s at 1000 Hz).
pub const PAD_LENGTH: usize = 2000;
/// Highest output voltage accepted by validation.
pub const VALID_VOLTAGE_HIGH: f64 = 4.9998;
/// Bytes per 16-bit device sample.
pub const SAMPLE_BYTES: usize = 2;
/// Input channels the 1401 can sample at 1000 Hz each from its 1 MHz clock.
pub const MAX_READ_CHANNELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaveformKind {
    Ramp,
    Pulse,
    PulseTrain,
    ConstantMultiChannel,
}

/// Duration bounds in ms for a waveform kind, as `(low, high)` inclusive.
///
/// For pulse trains the bound applies to the individual pulse, which is further limited by the
/// train's period.
pub fn valid_lengths(kind: WaveformKind) -> (usize, usize) {
    match kind {
        WaveformKind::Ramp => (1000, 30000),
        WaveformKind::Pulse => (10, 10000),
        WaveformKind::PulseTrain => (1, 10000),
        WaveformKind::ConstantMultiChannel => (1000, 20000),
    }
}

/// Immutable description of a stimulus request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaveformSpec {
    /// Red always on, blue ramps linearly from 0 V to `blue_voltage`.
    Ramp {
        duration_ms: usize,
        blue_voltage: f64,
        red_voltage: f64,
    },
    /// Red always on, blue held at `blue_voltage` for `duration_ms`.
    Pulse {
        duration_ms: usize,
        blue_voltage: f64,
        red_voltage: f64,
    },
    /// Red always on, `num_pulses` blue pulses at `freq_hz`.
    PulseTrain {
        pulse_length_ms: usize,
        blue_voltage: f64,
        red_voltage: f64,
        freq_hz: f64,
        num_pulses: usize,
    },
    /// Red always on, green and laser held for `duration_ms`.
    RedGreenLaser {
        duration_ms: usize,
        green_voltage: f64,
        laser_voltage: f64,
        red_voltage: f64,
    },
}

impl WaveformSpec {
    pub fn kind(&self) -> WaveformKind {
        match self {
            WaveformSpec::Ramp { .. } => WaveformKind::Ramp,
            WaveformSpec::Pulse { .. } => WaveformKind::Pulse,
            WaveformSpec::PulseTrain { .. } => WaveformKind::PulseTrain,
            WaveformSpec::RedGreenLaser { .. } => WaveformKind::ConstantMultiChannel,
        }
    }

    /// Output channel names in DAC port order.
    pub fn channel_names(&self) -> &'static [&'static str] {
        match self {
            WaveformSpec::RedGreenLaser { .. } => &["red", "green", "laser"],
            _ => &["red", "blue"],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_names().len()
    }

    /// Number of input channels actually sampled.
    ///
    /// Three output channels cannot be sampled at exactly 1000 Hz each from the 1 MHz clock
    /// (1,000,000 is not divisible by 3000), so the three-channel kind samples red and green only.
    pub fn read_channel_count(&self) -> usize {
        self.channel_count().min(MAX_READ_CHANNELS)
    }

    pub fn red_voltage(&self) -> f64 {
        match *self {
            WaveformSpec::Ramp { red_voltage, .. }
            | WaveformSpec::Pulse { red_voltage, .. }
            | WaveformSpec::PulseTrain { red_voltage, .. }
            | WaveformSpec::RedGreenLaser { red_voltage, .. } => red_voltage,
        }
    }

    /// Pulse period in ms, `round(1000 / freq)`. `None` for kinds other than pulse trains.
    pub fn period_ms(&self) -> Option<usize> {
        match *self {
            WaveformSpec::PulseTrain { freq_hz, .. } => {
                Some((SAMPLING_RATE / freq_hz).round() as usize)
            }
            _ => None,
        }
    }

    /// Length in samples of the stimulus segment, excluding padding.
    pub fn stimulus_len(&self) -> usize {
        match *self {
            WaveformSpec::Ramp { duration_ms, .. }
            | WaveformSpec::Pulse { duration_ms, .. }
            | WaveformSpec::RedGreenLaser { duration_ms, .. } => duration_ms,
            WaveformSpec::PulseTrain { num_pulses, .. } => {
                num_pulses * self.period_ms().unwrap_or(0)
            }
        }
    }

    /// Checks every parameter against the kind-specific valid ranges.
    ///
    /// ```
    /// use stimcompiler_backend::waveform::*;
    /// let limits = StimLimits::default();
    /// let ok = WaveformSpec::Pulse { duration_ms: 500, blue_voltage: 2.0, red_voltage: 4.0 };
    /// assert!(ok.validate(&limits).is_ok());
    /// let too_long = WaveformSpec::Pulse { duration_ms: 20000, blue_voltage: 2.0, red_voltage: 4.0 };
    /// assert!(too_long.validate(&limits).is_err());
    /// ```
    pub fn validate(&self, limits: &StimLimits) -> Result<()> {
        let max = limits.max_voltage;
        let (len_low, len_high) = valid_lengths(self.kind());
        let in_len = |len: usize| len_low <= len && len <= len_high;
        // Voltages strictly above zero
        let positive = |v: f64| v.is_finite() && 0. < v && v <= max;
        // Voltages allowed to rest at zero
        let non_negative = |v: f64| v.is_finite() && 0. <= v && v <= max;

        match *self {
            WaveformSpec::Ramp {
                duration_ms,
                blue_voltage,
                red_voltage,
            }
            | WaveformSpec::Pulse {
                duration_ms,
                blue_voltage,
                red_voltage,
            } => {
                if positive(blue_voltage) && positive(red_voltage) && in_len(duration_ms) {
                    return Ok(());
                }
                Err(StimError::Validation(format!(
                    "{:?}: length must be from {}ms to {}ms and voltages from 0V (exclusive) to {}V, got {}ms, blue {}V, red {}V",
                    self.kind(), len_low, len_high, max, duration_ms, blue_voltage, red_voltage
                )))
            }
            WaveformSpec::PulseTrain {
                pulse_length_ms,
                blue_voltage,
                red_voltage,
                freq_hz,
                num_pulses,
            } => {
                if !(non_negative(blue_voltage) && non_negative(red_voltage)) {
                    return Err(StimError::Validation(format!(
                        "PulseTrain: voltages must be from 0V to {}V, got blue {}V, red {}V",
                        max, blue_voltage, red_voltage
                    )));
                }
                if !(freq_hz.is_finite() && (0.1..=10.).contains(&freq_hz)) {
                    return Err(StimError::Validation(format!(
                        "PulseTrain: frequency must be from 0.1Hz to 10Hz, got {}Hz",
                        freq_hz
                    )));
                }
                if !(1..=100).contains(&num_pulses) {
                    return Err(StimError::Validation(format!(
                        "PulseTrain: number of pulses must be from 1 to 100, got {}",
                        num_pulses
                    )));
                }
                if !in_len(pulse_length_ms) {
                    return Err(StimError::Validation(format!(
                        "PulseTrain: pulse length must be from {}ms to {}ms, got {}ms",
                        len_low, len_high, pulse_length_ms
                    )));
                }
                let period = self.period_ms().unwrap_or(0);
                if pulse_length_ms > period {
                    return Err(StimError::Validation(format!(
                        "PulseTrain: pulse length {}ms cannot exceed its period (1/freq = {}ms)",
                        pulse_length_ms, period
                    )));
                }
                Ok(())
            }
            WaveformSpec::RedGreenLaser {
                duration_ms,
                green_voltage,
                laser_voltage,
                red_voltage,
            } => {
                if non_negative(green_voltage)
                    && non_negative(laser_voltage)
                    && positive(red_voltage)
                    && in_len(duration_ms)
                {
                    return Ok(());
                }
                Err(StimError::Validation(format!(
                    "RedGreenLaser: length must be from {}ms to {}ms and voltages from 0V to {}V, got {}ms, green {}V, laser {}V, red {}V",
                    len_low, len_high, max, duration_ms, green_voltage, laser_voltage, red_voltage
                )))
            }
        }
    }
}

/// Operating limits applied by validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StimLimits {
    pub max_voltage: f64,
}

impl Default for StimLimits {
    fn default() -> Self {
        Self {
            max_voltage: VALID_VOLTAGE_HIGH,
        }
    }
}

/// A validated waveform in device units, ready to be transferred.
#[derive(Debug, Clone)]
pub struct CompiledWaveform {
    pub spec: WaveformSpec,
    /// One row per output channel, in DAC port order.
    pub channels: Array2<i16>,
    /// Frame-interleaved buffer written to device memory at offset 0.
    pub interleaved: Vec<i16>,
    /// Input channels sampled during streaming.
    pub read_channel_count: usize,
    /// Total input samples (all read channels) the input region holds.
    pub read_sample_count: usize,
}

impl CompiledWaveform {
    pub fn channel_count(&self) -> usize {
        self.channels.nrows()
    }

    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.ncols()
    }

    pub fn output_bytes(&self) -> usize {
        self.interleaved.len() * SAMPLE_BYTES
    }

    pub fn input_bytes(&self) -> usize {
        self.read_sample_count * SAMPLE_BYTES
    }

    pub fn channel(&self, name: &str) -> Option<ArrayView1<i16>> {
        let idx = self.spec.channel_names().iter().position(|&n| n == name)?;
        Some(self.channels.row(idx))
    }

    /// Commanded output per channel name, converted back to volts.
    pub fn commanded_volts(&self, converter: &UnitConverter) -> IndexMap<String, Array1<f64>> {
        self.spec
            .channel_names()
            .iter()
            .zip(self.channels.axis_iter(Axis(0)))
            .map(|(&name, row)| (name.to_string(), row.mapv(|x| converter.from_device_units(x))))
            .collect()
    }
}

/// Lays out, renders and converts [`WaveformSpec`]s.
#[derive(Debug, Clone)]
pub struct WaveformBuilder {
    converter: UnitConverter,
    padding: usize,
    limits: StimLimits,
}

impl WaveformBuilder {
    pub fn new(converter: UnitConverter) -> Self {
        Self {
            converter,
            padding: PAD_LENGTH,
            limits: StimLimits::default(),
        }
    }

    /// Overrides the rest period around the stimulus. Must be at least one sample.
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_limits(mut self, limits: StimLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn limits(&self) -> &StimLimits {
        &self.limits
    }

    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    /// Validates `spec` and lays out its channels. Returns the channels and the frame count.
    pub fn layout(&self, spec: &WaveformSpec) -> Result<(Vec<Channel>, usize)> {
        spec.validate(&self.limits)?;
        if self.padding == 0 {
            return Err(StimError::Validation(
                "Padding must be at least one sample".to_string(),
            ));
        }
        let pad = self.padding;
        let total_len = spec.stimulus_len() + 2 * pad;

        let mut red = Channel::new("red");
        red.add_instr(Instruction::new_const(spec.red_voltage()), 0, total_len);

        let channels = match *spec {
            WaveformSpec::Ramp {
                duration_ms,
                blue_voltage,
                ..
            } => {
                let mut blue = Channel::new("blue");
                // duration_ms + 1 samples: the leading zero plus the ramp itself
                blue.add_instr(
                    Instruction::new_linramp(0., blue_voltage),
                    pad - 1,
                    duration_ms + 1,
                );
                vec![red, blue]
            }
            WaveformSpec::Pulse {
                duration_ms,
                blue_voltage,
                ..
            } => {
                let mut blue = Channel::new("blue");
                blue.add_instr(Instruction::new_const(blue_voltage), pad, duration_ms);
                vec![red, blue]
            }
            WaveformSpec::PulseTrain {
                pulse_length_ms,
                blue_voltage,
                num_pulses,
                ..
            } => {
                let period = spec.period_ms().unwrap_or(0);
                let mut blue = Channel::new("blue");
                for n in 0..num_pulses {
                    blue.add_instr(
                        Instruction::new_const(blue_voltage),
                        pad + n * period,
                        pulse_length_ms,
                    );
                }
                vec![red, blue]
            }
            WaveformSpec::RedGreenLaser {
                duration_ms,
                green_voltage,
                laser_voltage,
                ..
            } => {
                let mut green = Channel::new("green");
                green.add_instr(Instruction::new_const(green_voltage), pad, duration_ms);
                let mut laser = Channel::new("laser");
                laser.add_instr(Instruction::new_const(laser_voltage), pad, duration_ms);
                vec![red, green, laser]
            }
        };
        Ok((channels, total_len))
    }

    fn render(&self, spec: &WaveformSpec) -> Result<Array2<f64>> {
        let (channels, total_len) = self.layout(spec)?;
        let mut signal = Array2::zeros((channels.len(), total_len));
        for (chan, mut row) in channels.iter().zip(signal.axis_iter_mut(Axis(0))) {
            chan.fill_signal(&mut row);
        }
        Ok(signal)
    }

    /// Physical-unit rendering for display without a device.
    ///
    /// Same shapes as [`WaveformBuilder::build`], except that the red channel's first and last
    /// samples are 0 V (soft start and stop).
    pub fn preview(&self, spec: &WaveformSpec) -> Result<Array2<f64>> {
        let mut signal = self.render(spec)?;
        let last = signal.ncols() - 1;
        signal[[0, 0]] = 0.;
        signal[[0, last]] = 0.;
        Ok(signal)
    }

    /// Validates and compiles `spec` to device units.
    ///
    /// ```
    /// use stimcompiler_backend::units::*;
    /// use stimcompiler_backend::waveform::*;
    ///
    /// let builder = WaveformBuilder::new(UnitConverter::new(VoltageRange::Five));
    /// let spec = WaveformSpec::Pulse { duration_ms: 500, blue_voltage: 2.0, red_voltage: 4.0 };
    /// let wave = builder.build(&spec).unwrap();
    /// assert_eq!(wave.frames(), 500 + 2 * PAD_LENGTH);
    /// // red, blue, red, blue, ...
    /// assert_eq!(wave.interleaved[0], wave.channels[[0, 0]]);
    /// assert_eq!(wave.interleaved[1], wave.channels[[1, 0]]);
    /// ```
    pub fn build(&self, spec: &WaveformSpec) -> Result<CompiledWaveform> {
        let signal = self.render(spec)?;
        let channels = signal.mapv(|v| self.converter.to_device_units(v));
        // Transposed view iterates frame by frame, channel 0 first
        let interleaved: Vec<i16> = channels.t().iter().copied().collect();
        let read_channel_count = spec.read_channel_count();
        let read_sample_count = channels.ncols() * read_channel_count;
        log::debug!(
            "Compiled {:?}: {} channels x {} samples, sampling {} channels",
            spec.kind(),
            channels.nrows(),
            channels.ncols(),
            read_channel_count
        );
        Ok(CompiledWaveform {
            spec: spec.clone(),
            channels,
            interleaved,
            read_channel_count,
            read_sample_count,
        })
    }
}
