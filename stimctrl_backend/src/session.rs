//! The device link contract and checked wrappers around it.
//!
//! ## Overview
//!
//! [`DeviceSession`] is the narrow interface the execution engine drives: raw memory transfers,
//! ASCII commands, the write-cursor response and the device's last error. Every call reports
//! success as a `bool` and leaves the cause in [`DeviceSession::last_error`], mirroring how the
//! 1401 library reports failures.
//!
//! [`SessionExt`] is implemented for every session and turns those booleans into
//! [`StimError`]s carrying the device's native error code and text (see [`session_call`]).
//!
//! Implementations:
//! - [`crate::sim::SimulatedDevice`]: deterministic in-process fake.
//! - `crate::use1401::Ced1401Session` (feature `ced1401`): the vendor library.
//!
//! All memory offsets are in bytes; samples are 16-bit.

use stimcompiler_backend::error::{Result, StimError};
use stimcompiler_backend::waveform::SAMPLE_BYTES;

/// Identity of the connected device, queried once when the engine opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Model string, e.g. `Micro1401-4`.
    pub descriptor: String,
    /// Size of the user-addressable memory in bytes.
    pub user_memory_bytes: usize,
}

pub trait DeviceSession {
    /// Writes `data` to device memory starting at byte `offset`.
    fn write_memory(&mut self, offset: usize, data: &[i16]) -> bool;
    /// Fills `buf` from device memory starting at byte `offset`.
    fn read_memory(&mut self, buf: &mut [i16], offset: usize) -> bool;
    /// Sends one or more `;`-terminated commands.
    fn send_command(&mut self, cmd: &str) -> bool;
    /// Reads the integer response of the last query command, `None` on failure.
    fn poll_cursor(&mut self) -> Option<Vec<i32>>;
    /// Native error code and text of the last failed call.
    fn last_error(&self) -> (i32, String);
    fn device_info(&mut self) -> Option<DeviceInfo>;
}

impl<T: DeviceSession + ?Sized> DeviceSession for Box<T> {
    fn write_memory(&mut self, offset: usize, data: &[i16]) -> bool {
        (**self).write_memory(offset, data)
    }
    fn read_memory(&mut self, buf: &mut [i16], offset: usize) -> bool {
        (**self).read_memory(buf, offset)
    }
    fn send_command(&mut self, cmd: &str) -> bool {
        (**self).send_command(cmd)
    }
    fn poll_cursor(&mut self) -> Option<Vec<i32>> {
        (**self).poll_cursor()
    }
    fn last_error(&self) -> (i32, String) {
        (**self).last_error()
    }
    fn device_info(&mut self) -> Option<DeviceInfo> {
        (**self).device_info()
    }
}

/// Runs a session call and converts a failure to an error via `on_err(code, text)`.
///
/// Failures are logged at error level before being returned.
pub fn session_call<S, F, E>(session: &mut S, func: F, on_err: E) -> Result<()>
where
    S: DeviceSession + ?Sized,
    F: FnOnce(&mut S) -> bool,
    E: FnOnce(i32, String) -> StimError,
{
    if func(session) {
        return Ok(());
    }
    let (code, text) = session.last_error();
    let err = on_err(code, text);
    log::error!("{}", err);
    Err(err)
}

/// Checked versions of the [`DeviceSession`] calls.
pub trait SessionExt: DeviceSession {
    fn command(&mut self, cmd: &str) -> Result<()> {
        session_call(
            self,
            |s| s.send_command(cmd),
            |code, text| StimError::Device {
                context: format!("command `{}`", cmd),
                code,
                text,
            },
        )
    }

    fn write_checked(&mut self, offset: usize, data: &[i16]) -> Result<()> {
        session_call(
            self,
            |s| s.write_memory(offset, data),
            |code, text| StimError::Transfer {
                operation: "write device memory",
                code,
                text,
            },
        )
    }

    fn read_checked(&mut self, buf: &mut [i16], offset: usize) -> Result<()> {
        session_call(
            self,
            |s| s.read_memory(buf, offset),
            |code, text| StimError::Transfer {
                operation: "read device memory",
                code,
                text,
            },
        )
    }

    /// Reads one sample at byte `offset`.
    fn read_sample(&mut self, offset: usize) -> Result<i16> {
        let mut sample = [0i16; 1];
        self.read_checked(&mut sample, offset)?;
        Ok(sample[0])
    }

    /// First element of the pending integer response, as a byte position.
    fn cursor(&mut self) -> Result<usize> {
        let response = self.poll_cursor();
        match response.as_deref() {
            Some([pos, ..]) if *pos >= 0 && *pos as usize % SAMPLE_BYTES == 0 => Ok(*pos as usize),
            Some(other) => Err(StimError::Device {
                context: "cursor poll".to_string(),
                code: -1,
                text: format!("Unexpected cursor response {:?}", other),
            }),
            None => {
                let (code, text) = self.last_error();
                let err = StimError::Device {
                    context: "cursor poll".to_string(),
                    code,
                    text,
                };
                log::error!("{}", err);
                Err(err)
            }
        }
    }

    fn info_checked(&mut self) -> Result<DeviceInfo> {
        match self.device_info() {
            Some(info) => Ok(info),
            None => {
                let (code, text) = self.last_error();
                Err(StimError::Device {
                    context: "device info query".to_string(),
                    code,
                    text,
                })
            }
        }
    }
}

impl<T: DeviceSession + ?Sized> SessionExt for T {}
