//! Builders for the 1401 ASCII command language.
//!
//! Commands are comma-separated fields terminated by `;` and may be concatenated into one
//! transmission. Rates derive from the internal 1 MHz clock through two prescalers:
//!
//! | command | prescalers | rate |
//! |---|---|---|
//! | `memdac` (output) | 10 x 100 | 1000 Hz per frame |
//! | `adcmem` (input) | 5 x 100 | 2000 Hz total, 1000 Hz per channel with 2 channels |
//! | `DIGTIM` (camera) | 5 x 25 | 8 kHz tick |

use serde::{Deserialize, Serialize};

use stimcompiler_backend::error::{Result, StimError};

pub const CLEAR: &str = "clear;";
pub const KILL_OUTPUT: &str = "memdac,k;";
/// Queries the input write cursor; the device answers with the byte offset of the next byte.
pub const POLL_INPUT: &str = "adcmem,p;";

pub const MEMDAC_PRESCALE: u32 = 10;
pub const ADCMEM_PRESCALE: u32 = 5;
pub const CLOCK_COUNT: u32 = 100;

pub const DIGTIM_PRESET1: u32 = 5;
pub const DIGTIM_PRESET2: u32 = 25;
/// Bytes reserved for the `DIGTIM` pulse table.
pub const DIGTIM_TABLE_BYTES: usize = 32;
/// DAC ports driven by the photostimulator.
pub const DAC_CHANNELS: u8 = 3;

/// Command modules loaded onto the 1401 when a session opens.
pub const COMMAND_MODULES: [&str; 4] = ["ADCMEM", "MEMDAC", "CLEAR", "DIGTIM"];
/// Directory the vendor installer puts the command files in.
pub const DEFAULT_COMMAND_DIR: &str = r"c:\1401";

/// Comma-separated module list in the form the loader expects.
pub fn command_module_list() -> String {
    COMMAND_MODULES.join(",")
}

/// Interprets the loader's result: zero on success, otherwise the error code in the low word
/// and the index of the module that failed in the high word.
pub fn check_command_load(result: u32, dir: &str) -> Result<()> {
    if result == 0 {
        return Ok(());
    }
    let code = (result & 0xffff) as u16 as i16 as i32;
    let index = (result >> 16) as usize;
    let module = COMMAND_MODULES.get(index).copied().unwrap_or("?");
    Err(StimError::Device {
        context: format!("load command module {} from {}", module, dir),
        code,
        text: format!("loader returned {:#x}", result),
    })
}

fn channel_list(num_channels: usize) -> String {
    (0..num_channels)
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn transfer_command(name: &str, prescale: u32, start: usize, bytes: usize, num_channels: usize) -> String {
    // interrupt mode, 16-bit, one repetition, internal clock
    format!(
        "{},i,2,{},{},{},1,c,{},{};",
        name,
        start,
        bytes,
        channel_list(num_channels),
        prescale,
        CLOCK_COUNT
    )
}

/// Plays `bytes` of interleaved output from byte `start` on DACs `0..num_channels`.
///
/// ```
/// use stimctrl_backend::command::memdac;
/// assert_eq!(memdac(0, 9000, 2), "memdac,i,2,0,9000,0 1,1,c,10,100;");
/// ```
pub fn memdac(start: usize, bytes: usize, num_channels: usize) -> String {
    transfer_command("memdac", MEMDAC_PRESCALE, start, bytes, num_channels)
}

/// Samples ADCs `0..num_channels` into `bytes` of memory from byte `start`.
pub fn adcmem(start: usize, bytes: usize, num_channels: usize) -> String {
    transfer_command("adcmem", ADCMEM_PRESCALE, start, bytes, num_channels)
}

/// Sets a DAC directly to a level in device units.
pub fn dac(channel: u8, units: i16) -> String {
    format!("DAC,{},{};", channel, units)
}

/// Kill sequence issued on withdrawal: stop output, then force every DAC to zero.
pub fn abort_sequence() -> Vec<String> {
    std::iter::once(KILL_OUTPUT.to_string())
        .chain((0..DAC_CHANNELS).map(|c| dac(c, 0)))
        .collect()
}

/// Trigger train for an external high-speed camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraTrigger {
    pub fps: f64,
    pub length_s: f64,
}

impl CameraTrigger {
    pub fn new(fps: f64, length_s: f64) -> Result<Self> {
        let trigger = Self { fps, length_s };
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn clock_hz() -> f64 {
        1e6 / (DIGTIM_PRESET1 * DIGTIM_PRESET2) as f64
    }

    pub fn validate(&self) -> Result<()> {
        let max_fps = Self::clock_hz() / 2.;
        if !(self.fps.is_finite() && 0. < self.fps && self.fps <= max_fps) {
            return Err(StimError::Validation(format!(
                "Camera frame rate must be in (0, {}] fps, got {}",
                max_fps, self.fps
            )));
        }
        if !(self.length_s.is_finite() && self.length_s > 0.) {
            return Err(StimError::Validation(format!(
                "Camera recording length must be positive, got {}s",
                self.length_s
            )));
        }
        Ok(())
    }

    /// `DIGTIM` program: a square wave of `fps` repeated `fps * length_s` times, half the
    /// period high.
    ///
    /// The pulse table lives at byte `table_start`.
    ///
    /// ```
    /// use stimctrl_backend::command::CameraTrigger;
    /// let cmd = CameraTrigger { fps: 1000., length_s: 2. }.command(18000);
    /// assert_eq!(
    ///     cmd,
    ///     "DIGTIM,SD,18000,32;DIGTIM,A,1,1,4;DIGTIM,A,1,0,4;DIGTIM,C,5,25,2000;"
    /// );
    /// ```
    pub fn command(&self, table_start: usize) -> String {
        let repeats = (self.fps * self.length_s) as u64;
        let period = (Self::clock_hz() / self.fps) as u64;
        let on_ticks = period / 2;
        let off_ticks = period - on_ticks;
        format!(
            "DIGTIM,SD,{},{};DIGTIM,A,1,1,{};DIGTIM,A,1,0,{};DIGTIM,C,{},{},{};",
            table_start,
            DIGTIM_TABLE_BYTES,
            on_ticks,
            off_ticks,
            DIGTIM_PRESET1,
            DIGTIM_PRESET2,
            repeats
        )
    }
}

/// Combined start command: clear pending state, start output and input, arm the camera.
pub fn start_stream(
    output_bytes: usize,
    out_channels: usize,
    input_bytes: usize,
    in_channels: usize,
    camera: Option<&CameraTrigger>,
) -> String {
    let mut cmd = String::from("CLEAR;");
    cmd.push_str(&memdac(0, output_bytes, out_channels));
    cmd.push_str(&adcmem(output_bytes, input_bytes, in_channels));
    if let Some(trigger) = camera {
        cmd.push_str(&trigger.command(2 * output_bytes));
    }
    cmd
}
