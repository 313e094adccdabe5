//! Minimal rust wrapper for the parts of the CED `Use1432` library the engine needs.
//!
//! ## Overview
//!
//! [`Ced1401Session`] owns a 1401 handle and implements [`DeviceSession`] over the library's
//! string command, memory transfer and integer response calls. Every library call goes through
//! [`u14_call`], which records the native error code and text for [`DeviceSession::last_error`]
//! and, in addition to logging, appends it to `ced1401_error.logs` in the working directory of the
//! calling shell.
//!
//! Opening a session also loads the command modules in [`crate::command::COMMAND_MODULES`] from
//! the vendor's command directory (`c:\1401` unless configured otherwise).
//!
//! Only compiled with the `ced1401` feature; links against `Use1432`.

use libc;
use std::ffi::{CStr, CString};
use std::fs::OpenOptions;
use std::io::Write;

use stimcompiler_backend::error::{Result, StimError};

use crate::command::{check_command_load, command_module_list, DEFAULT_COMMAND_DIR};
use crate::session::{DeviceInfo, DeviceSession};

type CShort = libc::c_short;
type CWord = libc::c_ushort;
type CDword = libc::c_uint;
type CLong = libc::c_long;
type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;

/// Transfer element size: 16-bit words.
const ESZ_WORDS: CShort = 1;
const MAX_RESPONSE_LONGS: usize = 16;

#[link(name = "Use1432")]
extern "C" {
    fn U14Open1401(n1401: CShort) -> CShort;
    fn U14Close1401(hand: CShort) -> CShort;
    fn U14SendString(hand: CShort, string: CConstStr) -> CShort;
    fn U14LongsFrom1401(hand: CShort, buffer: *mut CLong, max_longs: CShort) -> CShort;
    fn U14To1401(hand: CShort, host: CConstStr, size: CDword, addr_1401: CDword, esz: CShort) -> CShort;
    fn U14ToHost(hand: CShort, host: CCharBuf, size: CDword, addr_1401: CDword, esz: CShort) -> CShort;
    fn U14TypeOf1401(hand: CShort) -> CShort;
    fn U14GetUserMemorySize(hand: CShort, size: *mut CDword) -> CShort;
    fn U14Ld(hand: CShort, vl: CConstStr, str: CConstStr) -> CDword;
    fn U14GetErrorString(err: CShort, buffer: CCharBuf, max_len: CWord) -> CShort;
}

fn error_text(code: CShort) -> String {
    let mut err_buff = [0 as libc::c_char; 512];
    unsafe {
        U14GetErrorString(code, err_buff.as_mut_ptr(), err_buff.len() as CWord);
    }
    unsafe { CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Checks a library return code. Negative codes are errors: they are logged, appended to
/// `./ced1401_error.logs` and returned with their text.
pub fn u14_call<F: FnOnce() -> CShort>(func: F) -> std::result::Result<CShort, (i32, String)> {
    let code = func();
    if code >= 0 {
        return Ok(code);
    }
    let text = error_text(code);
    log::error!("CED1401 Error {}: {}", code, text);
    let logged = OpenOptions::new()
        .append(true)
        .create(true)
        .open("./ced1401_error.logs")
        .and_then(|mut file| writeln!(file, "CED1401 Error {}: {}", code, text));
    if let Err(e) = logged {
        log::warn!("Failed to write ced1401_error.logs: {}", e);
    }
    Err((code as i32, text))
}

/// Model names by `U14TypeOf1401` code.
pub fn descriptor_of(type_code: CShort) -> String {
    match type_code {
        0 => "Standard 1401".to_string(),
        1 => "1401plus".to_string(),
        2 => "micro1401".to_string(),
        3 => "Power1401".to_string(),
        4 => "Micro1401-2".to_string(),
        5 => "Power1401-2".to_string(),
        6 => "Micro1401-3".to_string(),
        7 => "Power1401-3".to_string(),
        8 => "Micro1401-4".to_string(),
        n => format!("1401 type {}", n),
    }
}

pub struct Ced1401Session {
    handle: CShort,
    last_error: (i32, String),
}

impl Ced1401Session {
    /// Opens 1401 number `index` (0 for the first one found) and loads the command modules from
    /// the default directory.
    pub fn open(index: u16) -> Result<Self> {
        Self::open_with_commands(index, DEFAULT_COMMAND_DIR)
    }

    pub fn open_with_commands(index: u16, command_dir: &str) -> Result<Self> {
        let session = match u14_call(|| unsafe { U14Open1401(index as CShort) }) {
            Ok(handle) => {
                log::info!("Opened 1401 {} with handle {}", index, handle);
                Self {
                    handle,
                    last_error: (0, String::new()),
                }
            }
            Err((code, text)) => {
                return Err(StimError::Device {
                    context: format!("open 1401 {}", index),
                    code,
                    text,
                })
            }
        };
        // On failure `session` is dropped here, closing the handle
        session.load_commands(command_dir)?;
        Ok(session)
    }

    fn load_commands(&self, command_dir: &str) -> Result<()> {
        let modules = command_module_list();
        let (Ok(dir), Ok(list)) = (CString::new(command_dir), CString::new(modules.as_str())) else {
            return Err(StimError::Config(format!(
                "Command directory `{}` contains a NUL byte",
                command_dir
            )));
        };
        let result = unsafe { U14Ld(self.handle, dir.as_ptr(), list.as_ptr()) };
        check_command_load(result as u32, command_dir)?;
        log::info!("Loaded {} from {}", modules, command_dir);
        Ok(())
    }

    fn check<F: FnOnce() -> CShort>(&mut self, func: F) -> Option<CShort> {
        match u14_call(func) {
            Ok(code) => Some(code),
            Err(err) => {
                self.last_error = err;
                None
            }
        }
    }
}

impl DeviceSession for Ced1401Session {
    fn write_memory(&mut self, offset: usize, data: &[i16]) -> bool {
        let handle = self.handle;
        self.check(|| unsafe {
            U14To1401(
                handle,
                data.as_ptr() as CConstStr,
                (data.len() * 2) as CDword,
                offset as CDword,
                ESZ_WORDS,
            )
        })
        .is_some()
    }

    fn read_memory(&mut self, buf: &mut [i16], offset: usize) -> bool {
        let handle = self.handle;
        let size = (buf.len() * 2) as CDword;
        self.check(|| unsafe {
            U14ToHost(handle, buf.as_mut_ptr() as CCharBuf, size, offset as CDword, ESZ_WORDS)
        })
        .is_some()
    }

    fn send_command(&mut self, cmd: &str) -> bool {
        let Ok(cmd_cstr) = CString::new(cmd) else {
            self.last_error = (-1, format!("Command `{}` contains a NUL byte", cmd));
            return false;
        };
        let handle = self.handle;
        self.check(|| unsafe { U14SendString(handle, cmd_cstr.as_ptr()) })
            .is_some()
    }

    fn poll_cursor(&mut self) -> Option<Vec<i32>> {
        let mut longs = [0 as CLong; MAX_RESPONSE_LONGS];
        let handle = self.handle;
        let count = self.check(|| unsafe {
            U14LongsFrom1401(handle, longs.as_mut_ptr(), MAX_RESPONSE_LONGS as CShort)
        })?;
        Some(longs[..count as usize].iter().map(|&x| x as i32).collect())
    }

    fn last_error(&self) -> (i32, String) {
        self.last_error.clone()
    }

    fn device_info(&mut self) -> Option<DeviceInfo> {
        let handle = self.handle;
        let type_code = self.check(|| unsafe { U14TypeOf1401(handle) })?;
        let mut user_memory: CDword = 0;
        self.check(|| unsafe { U14GetUserMemorySize(handle, &mut user_memory) })?;
        Some(DeviceInfo {
            descriptor: descriptor_of(type_code),
            user_memory_bytes: user_memory as usize,
        })
    }
}

impl Drop for Ced1401Session {
    fn drop(&mut self) {
        if let Err((code, text)) = u14_call(|| unsafe { U14Close1401(self.handle) }) {
            log::warn!("Closing 1401 failed: {} {}", code, text);
        }
    }
}
