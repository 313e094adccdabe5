//! Stimulus channels: a named, sorted collection of [`InstrBook`]s that renders to a sample array.
//!
//! Anything between instructions is at rest (0 V). See [`BaseChannel`] for editing and rendering
//! behaviour.

use ndarray::s;
use std::collections::BTreeSet;

use crate::instruction::*;

pub trait BaseChannel {
    // Field methods
    fn name(&self) -> &str;
    fn instr_list(&self) -> &BTreeSet<InstrBook>;
    // Mutable field references
    fn instr_list_(&mut self) -> &mut BTreeSet<InstrBook>;

    /// Places `instr` over `[start_pos, start_pos + len)`.
    ///
    /// Panics if the interval collides with an instruction already on the channel.
    fn add_instr(&mut self, instr: Instruction, start_pos: usize, len: usize) {
        let new_book = InstrBook::new(start_pos, start_pos + len, instr);
        let collision = self
            .instr_list()
            .iter()
            .find(|book| book.start_pos < new_book.end_pos && new_book.start_pos < book.end_pos);
        if let Some(book) = collision {
            panic!(
                "Channel {}: instruction {} collides with existing {}",
                self.name(),
                new_book,
                book
            );
        }
        self.instr_list_().insert(new_book);
    }

    /// Renders the channel into `arr`, zero outside its instructions.
    fn fill_signal(&self, arr: &mut ndarray::ArrayViewMut1<f64>) {
        arr.fill(0.);
        for book in self.instr_list().iter() {
            let end_pos = book.end_pos.min(arr.len());
            if book.start_pos >= end_pos {
                continue;
            }
            book.instr
                .eval_inplace(&mut arr.slice_mut(s![book.start_pos..end_pos]));
        }
    }
}

/// A named output channel of the photostimulator (red, blue, green or laser).
#[derive(Clone, Debug)]
pub struct Channel {
    name: String,
    instr_list: BTreeSet<InstrBook>,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instr_list: BTreeSet::new(),
        }
    }
}

impl BaseChannel for Channel {
    fn name(&self) -> &str {
        &self.name
    }
    fn instr_list(&self) -> &BTreeSet<InstrBook> {
        &self.instr_list
    }
    fn instr_list_(&mut self) -> &mut BTreeSet<InstrBook> {
        &mut self.instr_list
    }
}
