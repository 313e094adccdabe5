//! Provides the waveform segment primitives from which stimulus channels are assembled.
//!
//! ## Types
//!
//! - `InstrType`: the segment shapes the photostimulator emits, `CONST` for plateaus and `LINRAMP`
//!   for linear ramps.
//!
//! - `Instruction`: a segment shape (`InstrType`) plus its arguments (`InstrArgs`). Instructions are
//!   evaluated in-place over a sample-index view of a channel.
//!
//! - `InstrBook`: an instruction together with the sample interval it occupies on its channel.
//!
//! All positions are sample indices at the fixed 1000 Hz stimulus rate, so one sample is one
//! millisecond.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use maplit::hashmap;

/// Named numeric parameters of a segment, e.g. `value` for a plateau.
pub type InstrArgs = HashMap<String, f64>;

/// Enum type for different instructions. Supported instructions: `CONST`, `LINRAMP`
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InstrType {
    CONST,
    LINRAMP,
}
impl fmt::Display for InstrType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                InstrType::CONST => "CONST",
                InstrType::LINRAMP => "LINRAMP",
            }
        )
    }
}

/// A segment shape and its parameters.
///
/// Required keys per shape:
/// 1. `CONST`:
///    - `value`
/// 2. `LINRAMP`:
///    - `start_val`: value of the first sample
///    - `end_val`: value of the last sample
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub instr_type: InstrType,
    pub args: InstrArgs,
}
impl Instruction {
    /// Constructs an `Instruction` object, checking that `args` carries the keys its type needs.
    ///
    /// Panics on a missing key.
    ///
    /// ```should_panic
    /// # use stimcompiler_backend::instruction::*;
    /// let const_instr = Instruction::new(InstrType::CONST, InstrArgs::new());
    /// ```
    pub fn new(instr_type: InstrType, args: InstrArgs) -> Self {
        let panic_key = |key| {
            if !args.contains_key(key) {
                panic!("Expected instr type {} to contain key {}", instr_type, key)
            }
        };
        match instr_type {
            InstrType::CONST => panic_key("value"),
            InstrType::LINRAMP => {
                panic_key("start_val");
                panic_key("end_val");
            }
        };
        Instruction { instr_type, args }
    }

    pub fn new_const(value: f64) -> Instruction {
        Instruction::new(InstrType::CONST, hashmap! {String::from("value") => value})
    }

    /// A ramp whose first sample is `start_val` and whose last sample is exactly `end_val`,
    /// whatever the length of the interval it is evaluated over.
    pub fn new_linramp(start_val: f64, end_val: f64) -> Instruction {
        Instruction::new(
            InstrType::LINRAMP,
            hashmap! {
                String::from("start_val") => start_val,
                String::from("end_val") => end_val,
            },
        )
    }

    fn arg(&self, key: &str) -> f64 {
        // Presence is checked by the constructor
        self.args.get(key).copied().unwrap_or_default()
    }

    /// Populates the view with this instruction's values, one element per sample.
    ///
    /// ```
    /// use ndarray::Array1;
    /// use stimcompiler_backend::instruction::*;
    ///
    /// let mut seg = Array1::<f64>::zeros(5);
    /// Instruction::new_linramp(0., 2.).eval_inplace(&mut seg.view_mut());
    /// assert_eq!(seg.to_vec(), vec![0., 0.5, 1., 1.5, 2.]);
    /// ```
    pub fn eval_inplace(&self, arr: &mut ndarray::ArrayViewMut1<f64>) {
        match self.instr_type {
            InstrType::CONST => arr.fill(self.arg("value")),
            InstrType::LINRAMP => {
                let start_val = self.arg("start_val");
                let end_val = self.arg("end_val");
                let last = arr.len().saturating_sub(1);
                if last == 0 {
                    arr.fill(end_val);
                    return;
                }
                arr.indexed_iter_mut().for_each(|(i, x)| {
                    *x = start_val + (end_val - start_val) * (i as f64) / (last as f64)
                });
            }
        }
    }
}
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut args: Vec<_> = self.args.iter().collect();
        args.sort_by(|a, b| a.0.cmp(b.0));
        let args_string = args
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<String>>()
            .join(", ");
        write!(f, "[{}, {{{}}}]", self.instr_type, args_string)
    }
}

/// An instruction placed on a channel.
///
/// Covers samples `start_pos..end_pos`.
///
/// Ordering is by `start_pos` so a channel's books can live in a sorted set.
#[derive(Clone, Debug)]
pub struct InstrBook {
    pub start_pos: usize,
    pub end_pos: usize,
    pub instr: Instruction,
}
impl InstrBook {
    /// Panics unless `end_pos > start_pos`:
    ///
    /// ```should_panic
    /// # use stimcompiler_backend::instruction::*;
    /// let book = InstrBook::new(5, 5, Instruction::new_const(1.0));
    /// ```
    pub fn new(start_pos: usize, end_pos: usize, instr: Instruction) -> Self {
        assert!(
            end_pos > start_pos,
            "Segment {} must end after it starts, got {}..{}",
            instr,
            start_pos,
            end_pos
        );
        InstrBook {
            start_pos,
            end_pos,
            instr,
        }
    }
}
impl Ord for InstrBook {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_pos.cmp(&other.start_pos)
    }
}
impl PartialOrd for InstrBook {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for InstrBook {
    fn eq(&self, other: &Self) -> bool {
        self.start_pos == other.start_pos
    }
}
impl Eq for InstrBook {}
impl fmt::Display for InstrBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InstrBook({}, {}-{})",
            self.instr, self.start_pos, self.end_pos
        )
    }
}
