//! Deterministic in-process 1401 used by tests, the CLI's `--simulate` mode and the Python bindings.
//!
//! ## Model
//!
//! - Memory is a flat array of 16-bit samples addressed in bytes.
//! - Commands are parsed with the same grammar the engine emits (`clear`, `memdac`, `adcmem`,
//!   `DAC`, `DIGTIM`); anything else is rejected like an unknown command on the real device.
//! - Time only advances when the input cursor is queried: every `adcmem,p;` moves the cursor by
//!   `bytes_per_poll` bytes and samples the corresponding input slots.
//! - Each input channel is looped back from the DAC of the same index, scaled by a per-channel
//!   response profile (a step function of the frame index). While `memdac` is running the DAC
//!   follows the output buffer; after `memdac,k;` it holds its last level until a `DAC` command
//!   sets it.
//! - A read that reaches past the sampled part of the input region completes the acquisition
//!   first, as a bulk read after the stimulus would on hardware.
//!
//! Faults can be injected through [`SimFaults`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use maplit::btreemap;
use regex::{Captures, Regex};

use crate::command::DAC_CHANNELS;
use crate::session::{DeviceInfo, DeviceSession};

pub const DEFAULT_DESCRIPTOR: &str = "Micro1401-4";
pub const DEFAULT_USER_MEMORY_BYTES: usize = 1 << 20;

pub const ERR_UNKNOWN_COMMAND: i32 = -501;
pub const ERR_BAD_ADDRESS: i32 = -502;
pub const ERR_NO_RESPONSE: i32 = -503;
pub const ERR_INJECTED: i32 = -540;

fn command_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"^(?:(?P<clear>(?i:clear))",
            r"|(?P<prog>memdac|adcmem),i,2,(?P<start>\d+),(?P<bytes>\d+),(?P<chans>\d+(?: \d+)*),1,c,(?P<pre>\d+),(?P<cnt>\d+)",
            r"|(?P<kill>memdac,k)",
            r"|(?P<poll>adcmem,p)",
            r"|DAC,(?P<dac>\d+),(?P<level>-?\d+)",
            r"|(?P<digtim>DIGTIM,[A-Z]+(?:,-?\d+)*))$"
        ))
        .expect("Command grammar is a valid regex")
    })
}

/// Faults injected into the simulated device.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Every memory write fails.
    pub fail_write: bool,
    /// Reads starting at offset 0 return this sample index off by one.
    pub corrupt_readback: Option<usize>,
    /// Commands starting with this prefix are rejected.
    pub reject_command: Option<String>,
    /// The input cursor stops advancing at this byte position.
    pub stall_at: Option<usize>,
    /// The identity query fails.
    pub fail_info: bool,
}

#[derive(Debug, Clone, Copy)]
struct Program {
    start: usize,
    bytes: usize,
    channels: usize,
}

impl Program {
    fn frames(&self) -> usize {
        self.bytes / 2 / self.channels
    }
}

pub struct SimulatedDevice {
    info: DeviceInfo,
    memory: Vec<i16>,
    dac: [i16; DAC_CHANNELS as usize],
    output: Option<Program>,
    output_running: bool,
    input: Option<Program>,
    cursor: usize,
    bytes_per_poll: usize,
    pending_response: Option<Vec<i32>>,
    response: Vec<BTreeMap<usize, f64>>,
    faults: SimFaults,
    commands: Vec<String>,
    writes: usize,
    reads: usize,
    polls: usize,
    last_error: (i32, String),
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                descriptor: DEFAULT_DESCRIPTOR.to_string(),
                user_memory_bytes: DEFAULT_USER_MEMORY_BYTES,
            },
            memory: vec![0; DEFAULT_USER_MEMORY_BYTES / 2],
            dac: [0; DAC_CHANNELS as usize],
            output: None,
            output_running: false,
            input: None,
            cursor: 0,
            bytes_per_poll: 2,
            pending_response: None,
            response: Vec::new(),
            faults: SimFaults::default(),
            commands: Vec::new(),
            writes: 0,
            reads: 0,
            polls: 0,
            last_error: (0, String::new()),
        }
    }

    pub fn with_descriptor(mut self, descriptor: &str) -> Self {
        self.info.descriptor = descriptor.to_string();
        self
    }

    pub fn with_user_memory(mut self, bytes: usize) -> Self {
        self.info.user_memory_bytes = bytes;
        self.memory = vec![0; bytes / 2];
        self
    }

    /// Cursor advance per query. Must be a positive multiple of 2.
    pub fn with_bytes_per_poll(mut self, bytes: usize) -> Self {
        self.bytes_per_poll = bytes.max(2) & !1;
        self
    }

    /// From `from_frame` on, input `channel` reads `gain` times its DAC level.
    pub fn with_response(mut self, channel: usize, from_frame: usize, gain: f64) -> Self {
        while self.response.len() <= channel {
            self.response.push(btreemap! {0 => 1.0});
        }
        self.response[channel].insert(from_frame, gain);
        self
    }

    pub fn with_faults(mut self, faults: SimFaults) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults_mut(&mut self) -> &mut SimFaults {
        &mut self.faults
    }

    /// Every `send_command` transmission, verbatim and in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn polls(&self) -> usize {
        self.polls
    }

    pub fn dac_level(&self, channel: usize) -> Option<i16> {
        self.dac.get(channel).copied()
    }

    /// Whether a `memdac` program is currently driving the DACs.
    pub fn output_running(&self) -> bool {
        self.output_running
    }

    /// Bytes of the input region sampled so far.
    pub fn input_cursor(&self) -> usize {
        self.cursor
    }

    fn fail(&mut self, code: i32, text: String) -> bool {
        log::debug!("Simulated 1401 error {}: {}", code, text);
        self.last_error = (code, text);
        false
    }

    fn gain(&self, channel: usize, frame: usize) -> f64 {
        self.response
            .get(channel)
            .and_then(|steps| steps.range(..=frame).next_back())
            .map_or(1.0, |(_, &g)| g)
    }

    /// Level driven on DAC `channel` during output `frame`.
    fn output_level(&self, channel: usize, frame: usize) -> i16 {
        match self.output {
            Some(out) if self.output_running && channel < out.channels && frame < out.frames() => {
                self.memory[out.start / 2 + frame * out.channels + channel]
            }
            _ => self.dac.get(channel).copied().unwrap_or(0),
        }
    }

    /// Samples input slots until the cursor reaches `target` bytes.
    fn advance_to(&mut self, target: usize) {
        let Some(input) = self.input else { return };
        let target = target.min(input.bytes);
        while self.cursor < target {
            let slot = self.cursor / 2;
            let (frame, channel) = (slot / input.channels, slot % input.channels);
            let level = self.output_level(channel, frame) as f64 * self.gain(channel, frame);
            self.memory[input.start / 2 + slot] =
                level.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            self.cursor += 2;
        }
        // A finished single-shot acquisition stops driving the DACs too
        if self.cursor >= input.bytes {
            self.hold_output();
        }
    }

    fn hold_output(&mut self) {
        if !self.output_running {
            return;
        }
        let frame = match self.input {
            Some(input) => (self.cursor / 2 / input.channels).saturating_sub(1),
            None => 0,
        };
        for channel in 0..self.dac.len() {
            self.dac[channel] = self.output_level(channel, frame);
        }
        self.output_running = false;
    }

    fn program(&self, caps: &Captures) -> Option<Program> {
        let start: usize = caps["start"].parse().ok()?;
        let bytes: usize = caps["bytes"].parse().ok()?;
        let channels = caps["chans"].split(' ').count();
        let fits = start % 2 == 0 && bytes % (2 * channels) == 0 && start + bytes <= self.memory.len() * 2;
        fits.then_some(Program {
            start,
            bytes,
            channels,
        })
    }

    fn execute_one(&mut self, cmd: &str) -> bool {
        if let Some(prefix) = &self.faults.reject_command {
            if cmd.starts_with(prefix.as_str()) {
                return self.fail(ERR_INJECTED, format!("Command `{}` rejected", cmd));
            }
        }
        let Some(caps) = command_pattern().captures(cmd) else {
            return self.fail(ERR_UNKNOWN_COMMAND, format!("Unknown command `{}`", cmd));
        };

        if caps.name("clear").is_some() {
            self.output = None;
            self.output_running = false;
            self.input = None;
            self.cursor = 0;
            self.pending_response = None;
        } else if let Some(name) = caps.name("prog") {
            let Some(program) = self.program(&caps) else {
                return self.fail(ERR_BAD_ADDRESS, format!("Invalid transfer `{}`", cmd));
            };
            if name.as_str() == "memdac" {
                self.output = Some(program);
                self.output_running = true;
            } else {
                self.input = Some(program);
                self.cursor = 0;
            }
        } else if caps.name("kill").is_some() {
            self.hold_output();
        } else if caps.name("poll").is_some() {
            self.polls += 1;
            let step = match self.faults.stall_at {
                Some(stall) if self.cursor >= stall => 0,
                Some(stall) => self.bytes_per_poll.min(stall - self.cursor),
                None => self.bytes_per_poll,
            };
            self.advance_to(self.cursor + step);
            let finished = self.input.map_or(true, |input| self.cursor >= input.bytes);
            // A completed acquisition reports its cursor wrapped to the start
            let reported = if finished { 0 } else { self.cursor as i32 };
            self.pending_response = Some(vec![reported]);
        } else if let Some(channel) = caps.name("dac") {
            let channel: usize = channel.as_str().parse().unwrap_or(usize::MAX);
            let level: Option<i16> = caps["level"].parse().ok();
            match (channel < self.dac.len(), level) {
                (true, Some(level)) => self.dac[channel] = level,
                _ => return self.fail(ERR_BAD_ADDRESS, format!("Invalid DAC command `{}`", cmd)),
            }
        } else if let Some(table) = caps["digtim"].strip_prefix("DIGTIM,SD,") {
            let mut fields = table.split(',').map(|f| f.parse::<usize>().ok());
            let fits = match (fields.next().flatten(), fields.next().flatten()) {
                (Some(start), Some(bytes)) => start + bytes <= self.memory.len() * 2,
                _ => false,
            };
            if !fits {
                return self.fail(ERR_BAD_ADDRESS, format!("Pulse table `{}` out of range", cmd));
            }
        }
        // Other DIGTIM commands only drive the camera line
        true
    }

    fn range_ok(&self, offset: usize, len: usize) -> bool {
        offset % 2 == 0 && offset / 2 + len <= self.memory.len()
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSession for SimulatedDevice {
    fn write_memory(&mut self, offset: usize, data: &[i16]) -> bool {
        self.writes += 1;
        if self.faults.fail_write {
            return self.fail(ERR_INJECTED, "Transfer to 1401 failed".to_string());
        }
        if !self.range_ok(offset, data.len()) {
            return self.fail(ERR_BAD_ADDRESS, format!("Write of {} samples at {} out of range", data.len(), offset));
        }
        self.memory[offset / 2..offset / 2 + data.len()].copy_from_slice(data);
        true
    }

    fn read_memory(&mut self, buf: &mut [i16], offset: usize) -> bool {
        self.reads += 1;
        if !self.range_ok(offset, buf.len()) {
            return self.fail(ERR_BAD_ADDRESS, format!("Read of {} samples at {} out of range", buf.len(), offset));
        }
        if let Some(input) = self.input {
            let end = offset + 2 * buf.len();
            if offset < input.start + input.bytes && end > input.start + self.cursor {
                self.advance_to(end.saturating_sub(input.start));
            }
        }
        buf.copy_from_slice(&self.memory[offset / 2..offset / 2 + buf.len()]);
        if offset == 0 {
            if let Some(idx) = self.faults.corrupt_readback {
                if let Some(x) = buf.get_mut(idx) {
                    *x = x.wrapping_add(1);
                }
            }
        }
        true
    }

    fn send_command(&mut self, cmd: &str) -> bool {
        self.commands.push(cmd.to_string());
        cmd.split(';')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .all(|c| self.execute_one(c))
    }

    fn poll_cursor(&mut self) -> Option<Vec<i32>> {
        let response = self.pending_response.take();
        if response.is_none() {
            self.fail(ERR_NO_RESPONSE, "No response pending".to_string());
        }
        response
    }

    fn last_error(&self) -> (i32, String) {
        self.last_error.clone()
    }

    fn device_info(&mut self) -> Option<DeviceInfo> {
        if self.faults.fail_info {
            self.fail(ERR_INJECTED, "1401 not responding".to_string());
            return None;
        }
        Some(self.info.clone())
    }
}
