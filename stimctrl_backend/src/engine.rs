//! Real-time stimulus execution with early termination on withdrawal.
//!
//! ## Overview
//!
//! [`StimulusEngine::execute`] runs one stimulus end to end on a [`DeviceSession`]:
//!
//! 1. **Validating**: parameters, threshold and camera trigger are checked and the waveform is
//!    compiled. The output and input regions, plus the camera pulse table when a trigger is armed,
//!    must fit in the device's user memory. Nothing is sent to the device if this stage fails.
//! 2. **Transferring**: `clear;` then the interleaved buffer is written at byte 0.
//! 3. **Verifying**: the buffer is read back and compared sample by sample.
//! 4. **Streaming**: one combined command starts output, input sampling into the region right
//!    after the output, and optionally the camera trigger. The engine then busy-polls the input
//!    write cursor and feeds every newly completed red sample to a [`MovingAverageTerminator`].
//! 5. **Aborting**: when the terminator latches, output is killed and every DAC is zeroed. Polling
//!    continues until the acquisition ends.
//! 6. **Draining**: red is forced off and the whole input region is read back in one transfer.
//! 7. **Completed**: samples are converted to volts and de-interleaved per channel.
//!
//! Any device failure after validation issues a best-effort `memdac,k;` before the error is
//! returned and the engine moves to [`EngineState::Failed`].
//!
//! ## Cursor arithmetic
//!
//! The cursor is the byte offset of the *next* input byte to be written. With two input channels
//! the region is laid out `red0, ch1_0, red1, ch1_1, ...`, 2 bytes each. The engine reads the
//! sample 4 bytes behind the cursor, which is complete by the time the cursor is observed:
//! `(cursor / 2) % 2 == 0` means that sample is red, otherwise it is channel 1. Cursors below 4
//! have no complete sample yet.
//!
//! In three-channel mode only red and green are sampled: 1 MHz cannot be divided down to exactly
//! 3000 Hz, so the laser is reported as its commanded waveform instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use ndarray::{s, Array1};
use parking_lot::Mutex;

use stimcompiler_backend::calibration::{self, PowerCalibration};
use stimcompiler_backend::error::{FailureKind, Result, StimError};
use stimcompiler_backend::terminator::MovingAverageTerminator;
use stimcompiler_backend::units::{UnitConverter, VoltageRange};
use stimcompiler_backend::utils::TickTimer;
use stimcompiler_backend::waveform::*;

use crate::command::*;
use crate::session::{DeviceInfo, DeviceSession, SessionExt};

/// Byte distance between the cursor and the newest sample known to be complete.
pub const CURSOR_LAG_BYTES: usize = 2 * SAMPLE_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Validating,
    Transferring,
    Verifying,
    Streaming,
    Aborting,
    Draining,
    Completed,
    Failed(FailureKind),
}

/// One sample observed while polling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSample {
    pub frame: usize,
    pub value: f64,
}

/// Samples observed during streaming, in arrival order (volts).
#[derive(Debug, Clone, Default)]
pub struct LiveTrace {
    /// Red samples, each fed to the terminator.
    pub watched: Vec<LiveSample>,
    /// Channel 1 samples (blue or green).
    pub secondary: Vec<LiveSample>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Sampled channels in volts, `red` first.
    pub received: IndexMap<String, Array1<f64>>,
    /// Output channels that are not sampled, as commanded (volts).
    pub commanded: IndexMap<String, Array1<f64>>,
    pub terminator: MovingAverageTerminator,
    /// First frame not yet sampled when the abort sequence was sent.
    pub abort_frame: Option<usize>,
    pub live: LiveTrace,
}

impl ExecutionOutcome {
    pub fn has_terminated(&self) -> bool {
        self.terminator.has_terminated()
    }

    /// Frame index of the withdrawal onset detected live.
    pub fn latency(&self) -> Option<usize> {
        let idx = self.terminator.latency()?;
        self.live.watched.get(idx).map(|s| s.frame)
    }

    /// Received blue light in milliwatts.
    pub fn stimulus_power(&self, calibration: Option<&PowerCalibration>) -> Result<Array1<f64>> {
        let cal = calibration::require(calibration)?;
        let blue = self.received.get("blue").ok_or_else(|| {
            StimError::Validation("Stimulus has no blue channel to convert".to_string())
        })?;
        Ok(blue.mapv(|v| cal.to_milliwatts(v)))
    }
}

pub struct StimulusEngine<S: DeviceSession> {
    session: S,
    info: DeviceInfo,
    converter: UnitConverter,
    builder: WaveformBuilder,
    stall_timeout: Option<Duration>,
    state: EngineState,
    state_sink: Option<Arc<Mutex<EngineState>>>,
}

impl<S: DeviceSession> StimulusEngine<S> {
    /// Takes ownership of an open session, resolves the voltage range and clears the device.
    pub fn open(mut session: S) -> Result<Self> {
        let info = session.info_checked()?;
        let converter = UnitConverter::new(VoltageRange::from_descriptor(&info.descriptor));
        log::info!(
            "Opened {} ({} bytes user memory, +/-{} V)",
            info.descriptor,
            info.user_memory_bytes,
            converter.range().volts()
        );
        session.command(CLEAR)?;
        Ok(Self {
            session,
            info,
            converter,
            builder: WaveformBuilder::new(converter),
            stall_timeout: None,
            state: EngineState::Idle,
            state_sink: None,
        })
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.builder = self.builder.with_padding(padding);
        self
    }

    pub fn with_limits(mut self, limits: StimLimits) -> Self {
        self.builder = self.builder.with_limits(limits);
        self
    }

    /// Fails streaming with [`StimError::Timeout`] if the cursor stops advancing for `timeout`.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    /// Mirrors every state change into `sink`.
    pub fn with_state_sink(mut self, sink: Arc<Mutex<EngineState>>) -> Self {
        *sink.lock() = self.state;
        self.state_sink = Some(sink);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    pub fn builder(&self) -> &WaveformBuilder {
        &self.builder
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    fn set_state(&mut self, state: EngineState) {
        log::trace!("Engine state {:?} -> {:?}", self.state, state);
        self.state = state;
        if let Some(sink) = &self.state_sink {
            *sink.lock() = state;
        }
    }

    /// Sets DAC `channel` to `voltage` directly, e.g. to hold a steady light for calibration.
    pub fn set_dac(&mut self, channel: u8, voltage: f64) -> Result<()> {
        let range = self.converter.range().volts();
        if channel >= DAC_CHANNELS || !voltage.is_finite() || voltage.abs() > range {
            return Err(StimError::Validation(format!(
                "DAC {} cannot be set to {} V (channels 0-{}, +/-{} V)",
                channel,
                voltage,
                DAC_CHANNELS - 1,
                range
            )));
        }
        self.session
            .command(&dac(channel, self.converter.to_device_units(voltage)))
    }

    /// Runs one stimulus. See the module documentation for the stages.
    pub fn execute(
        &mut self,
        spec: &WaveformSpec,
        threshold: f64,
        camera: Option<&CameraTrigger>,
    ) -> Result<ExecutionOutcome> {
        let mut timer = TickTimer::new();
        match self.run(spec, threshold, camera, &mut timer) {
            Ok(outcome) => {
                self.set_state(EngineState::Completed);
                log::info!(
                    "{:?} completed, terminated: {}, latency: {:?}",
                    spec.kind(),
                    outcome.has_terminated(),
                    outcome.latency()
                );
                Ok(outcome)
            }
            Err(err) => {
                if err.session_suspect() && !self.session.send_command(KILL_OUTPUT) {
                    log::warn!("Kill after failure was not acknowledged: {:?}", self.session.last_error());
                }
                self.set_state(EngineState::Failed(err.kind()));
                Err(err)
            }
        }
    }

    fn run(
        &mut self,
        spec: &WaveformSpec,
        threshold: f64,
        camera: Option<&CameraTrigger>,
        timer: &mut TickTimer,
    ) -> Result<ExecutionOutcome> {
        self.set_state(EngineState::Validating);
        if !(threshold > 0. && threshold <= 1.) {
            return Err(StimError::Validation(format!(
                "Threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if let Some(trigger) = camera {
            trigger.validate()?;
        }
        let wave = self.builder.build(spec)?;
        let points = wave.output_bytes();
        // The camera pulse table sits after both regions
        let reserved = if camera.is_some() { DIGTIM_TABLE_BYTES } else { 0 };
        let limit = self.info.user_memory_bytes.saturating_sub(reserved) / 2;
        if points > limit {
            return Err(StimError::MemoryLimitExceeded {
                limit,
                requested: points,
            });
        }
        timer.tick_log("validate and build");

        self.set_state(EngineState::Transferring);
        self.session.command(CLEAR)?;
        self.session.write_checked(0, &wave.interleaved)?;
        timer.tick_log("transfer");

        self.set_state(EngineState::Verifying);
        let mut readback = vec![0i16; wave.interleaved.len()];
        self.session.read_checked(&mut readback, 0)?;
        if let Some(index) = wave
            .interleaved
            .iter()
            .zip(&readback)
            .position(|(a, b)| a != b)
        {
            return Err(StimError::VerificationMismatch {
                index,
                expected: wave.interleaved[index],
                found: readback[index],
            });
        }
        timer.tick_log("verify");

        self.set_state(EngineState::Streaming);
        self.session.command(&start_stream(
            points,
            wave.channel_count(),
            wave.input_bytes(),
            wave.read_channel_count,
            camera,
        ))?;
        let (terminator, abort_frame, live) = self.stream(&wave, threshold)?;
        timer.tick_log("stream");

        self.set_state(EngineState::Draining);
        self.session.command(&dac(0, 0))?;
        let mut raw = vec![0i16; wave.read_sample_count];
        self.session.read_checked(&mut raw, points)?;
        let volts = self.converter.from_device_slice(&raw);

        let names = spec.channel_names();
        let step = wave.read_channel_count as isize;
        let received: IndexMap<String, Array1<f64>> = names[..wave.read_channel_count]
            .iter()
            .enumerate()
            .map(|(c, &name)| (name.to_string(), volts.slice(s![c..;step]).to_owned()))
            .collect();
        let commanded = wave
            .commanded_volts(&self.converter)
            .into_iter()
            .filter(|(name, _)| !received.contains_key(name))
            .collect();
        timer.tick_log("drain");

        Ok(ExecutionOutcome {
            received,
            commanded,
            terminator,
            abort_frame,
            live,
        })
    }

    /// Busy-polls the input cursor until the acquisition ends.
    fn stream(
        &mut self,
        wave: &CompiledWaveform,
        threshold: f64,
    ) -> Result<(MovingAverageTerminator, Option<usize>, LiveTrace)> {
        let input_start = wave.output_bytes();
        // The last slot cannot be confirmed complete
        let end = wave.input_bytes() - SAMPLE_BYTES;
        let frame_bytes = SAMPLE_BYTES * wave.read_channel_count;

        let mut terminator = MovingAverageTerminator::new(threshold);
        let mut live = LiveTrace::default();
        let mut abort_frame = None;
        let (mut n, mut idx) = (0usize, 0usize);
        let mut last_advance = Instant::now();

        while n < end {
            self.session.command(POLL_INPUT)?;
            n = self.session.cursor()?;

            if n > idx && n >= CURSOR_LAG_BYTES {
                idx = n;
                last_advance = Instant::now();
                let raw = self.session.read_sample(input_start + n - CURSOR_LAG_BYTES)?;
                let sample = LiveSample {
                    frame: (n - CURSOR_LAG_BYTES) / frame_bytes,
                    value: self.converter.from_device_units(raw),
                };
                if (n / SAMPLE_BYTES) % 2 == 0 {
                    live.watched.push(sample);
                    if terminator.update(raw as f64) && n < end {
                        abort_frame = Some(n / frame_bytes);
                        self.abort()?;
                    }
                } else {
                    live.secondary.push(sample);
                }
            } else if n == 0 && idx > 0 {
                break;
            } else if let Some(timeout) = self.stall_timeout {
                let waited = last_advance.elapsed();
                if waited >= timeout {
                    return Err(StimError::Timeout {
                        stage: "streaming",
                        waited_ms: waited.as_millis(),
                    });
                }
            }
        }
        Ok((terminator, abort_frame, live))
    }

    fn abort(&mut self) -> Result<()> {
        self.set_state(EngineState::Aborting);
        log::info!("Withdrawal detected. Terminating stimulus...");
        for cmd in abort_sequence() {
            self.session.command(&cmd)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::*;

    fn pulse() -> WaveformSpec {
        WaveformSpec::Pulse {
            duration_ms: 20,
            blue_voltage: 2.0,
            red_voltage: 4.0,
        }
    }

    #[test]
    fn completes_without_withdrawal() {
        let mut engine = StimulusEngine::open(SimulatedDevice::new())
            .unwrap()
            .with_padding(10);
        assert_eq!(engine.state(), EngineState::Idle);
        let outcome = engine.execute(&pulse(), 0.9, None).unwrap();
        assert_eq!(engine.state(), EngineState::Completed);
        assert!(!outcome.has_terminated());
        assert_eq!(outcome.abort_frame, None);

        let red = &outcome.received["red"];
        let blue = &outcome.received["blue"];
        assert_eq!(red.len(), 40);
        assert!((blue[15] - 2.0).abs() <= engine.converter().step());
        assert_eq!(blue[5], 0.);
        assert!(outcome.commanded.is_empty());
        // Every red sample except the last frame was observed live
        assert_eq!(outcome.live.watched.len(), 39);
        assert_eq!(outcome.live.watched[3].frame, 3);
        assert_eq!(outcome.live.secondary[0].frame, 0);
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let mut engine = StimulusEngine::open(SimulatedDevice::new()).unwrap();
        for t in [0., 1.5, f64::NAN] {
            let err = engine.execute(&pulse(), t, None).unwrap_err();
            assert_eq!(err.kind(), FailureKind::Validation);
            assert_eq!(engine.state(), EngineState::Failed(FailureKind::Validation));
        }
    }

    #[test]
    fn set_dac_checks_channel_and_range() {
        let mut engine = StimulusEngine::open(SimulatedDevice::new()).unwrap();
        engine.set_dac(1, 2.5).unwrap();
        assert_eq!(engine.session().dac_level(1), Some(16384));
        assert_eq!(engine.session().commands().last().unwrap(), "DAC,1,16384;");
        assert!(engine.set_dac(3, 1.0).is_err());
        assert!(engine.set_dac(0, 5.5).is_err());
    }

    #[test]
    fn state_sink_follows_engine() {
        let sink = Arc::new(Mutex::new(EngineState::Failed(FailureKind::Config)));
        let mut engine = StimulusEngine::open(SimulatedDevice::new())
            .unwrap()
            .with_padding(10)
            .with_state_sink(sink.clone());
        assert_eq!(*sink.lock(), EngineState::Idle);
        engine.execute(&pulse(), 0.9, None).unwrap();
        assert_eq!(*sink.lock(), EngineState::Completed);
    }
}
