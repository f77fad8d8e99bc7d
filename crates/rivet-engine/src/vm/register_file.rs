//! Register file for the register-based interpreter.
//!
//! Replaces an operand stack for value storage. Each function call occupies
//! a window of registers in one contiguous array; nested calls stack their
//! windows on top of the caller's.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Frame 2 registers (current)            │  ← top
//! │   r0 (param 0)                         │
//! │   r1 (param 1)                         │
//! │   r2 (local)                           │
//! │   r3 (temp)                            │
//! ├────────────────────────────────────────┤
//! │ Frame 1 registers                      │  ← reg_base for frame 2
//! │   r0..rN                               │
//! ├────────────────────────────────────────┤
//! │ Frame 0 registers (entry function)     │  ← reg_base for frame 1
//! │   r0..rM                               │
//! └────────────────────────────────────────┘  ← reg_base=0 for frame 0
//! ```
//!
//! Indices passed to `get`/`set`/`get_reg`/`set_reg` are trusted: the
//! compiler only ever emits register operands within a frame it sized
//! itself, so out-of-bounds access here is an interpreter bug, not a
//! reachable runtime condition — checked with `debug_assert!` rather than a
//! `Result`. Only [`RegisterFile::alloc_frame`], which grows the file to fit
//! a new call, can fail at runtime (deep enough recursion exhausts it).

use crate::value::Value;
use crate::vm::{RuntimeError, VmResult};

/// Default maximum register file size (in slots).
const DEFAULT_MAX_SIZE: usize = 1024 * 64;

/// Contiguous register storage for one [`crate::runtime::Runtime`]. Frames
/// are windows into this array, each with a `reg_base` and `reg_count`.
#[derive(Debug)]
pub struct RegisterFile {
    registers: Vec<Value>,
    /// Next free register slot (top of allocated space).
    top: usize,
    max_size: usize,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            registers: Vec::with_capacity(256),
            top: 0,
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            registers: Vec::with_capacity(256),
            top: 0,
            max_size,
        }
    }

    /// Allocates a new frame of `count` registers, returning its base
    /// index. All registers in the frame start out `nil`.
    pub fn alloc_frame(&mut self, count: usize) -> VmResult<usize> {
        let base = self.top;
        let new_top = base + count;
        if new_top > self.max_size {
            return Err(RuntimeError::StackOverflow);
        }
        if new_top > self.registers.len() {
            self.registers.resize(new_top, Value::nil());
        } else {
            for slot in &mut self.registers[base..new_top] {
                *slot = Value::nil();
            }
        }
        self.top = new_top;
        Ok(base)
    }

    /// Frees the topmost frame, shrinking back to `base` (the value
    /// returned by the matching `alloc_frame`).
    #[inline]
    pub fn free_frame(&mut self, base: usize) {
        debug_assert!(base <= self.top);
        self.top = base;
    }

    #[inline]
    pub fn get(&self, index: usize) -> Value {
        debug_assert!(index < self.top, "register {index} out of bounds (top={})", self.top);
        self.registers[index]
    }

    #[inline]
    pub fn get_reg(&self, reg_base: usize, offset: u8) -> Value {
        self.get(reg_base + offset as usize)
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.top, "register {index} out of bounds (top={})", self.top);
        self.registers[index] = value;
    }

    #[inline]
    pub fn set_reg(&mut self, reg_base: usize, offset: u8, value: Value) {
        self.set(reg_base + offset as usize, value);
    }

    /// A slice of `count` registers starting at `base`, used to collect
    /// consecutive call arguments.
    #[inline]
    pub fn get_slice(&self, base: usize, count: usize) -> &[Value] {
        debug_assert!(base + count <= self.top);
        &self.registers[base..base + count]
    }

    /// Copies `count` registers from `src_base` to `dst_base`, used when
    /// moving call arguments into a callee's freshly allocated frame.
    pub fn copy_regs(&mut self, src_base: usize, dst_base: usize, count: usize) {
        debug_assert!(src_base + count <= self.top);
        debug_assert!(dst_base + count <= self.top);
        self.registers.copy_within(src_base..src_base + count, dst_base);
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    pub fn stats(&self) -> RegisterFileStats {
        RegisterFileStats {
            top: self.top,
            capacity: self.registers.capacity(),
            max_size: self.max_size,
        }
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of register file usage, handy for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct RegisterFileStats {
    pub top: usize,
    pub capacity: usize,
    pub max_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_register_file_is_empty() {
        let rf = RegisterFile::new();
        assert_eq!(rf.top(), 0);
        assert!(rf.is_empty());
        assert_eq!(rf.max_size(), DEFAULT_MAX_SIZE);
    }

    #[test]
    fn alloc_and_free_frame() {
        let mut rf = RegisterFile::new();

        let base = rf.alloc_frame(4).unwrap();
        assert_eq!(base, 0);
        assert_eq!(rf.top(), 4);
        for i in 0..4 {
            assert!(rf.get(i).is_nil());
        }

        let base2 = rf.alloc_frame(3).unwrap();
        assert_eq!(base2, 4);
        assert_eq!(rf.top(), 7);

        rf.free_frame(base2);
        assert_eq!(rf.top(), 4);

        rf.free_frame(base);
        assert_eq!(rf.top(), 0);
        assert!(rf.is_empty());
    }

    #[test]
    fn get_set_absolute() {
        let mut rf = RegisterFile::new();
        rf.alloc_frame(4).unwrap();

        rf.set(0, Value::number(42.0));
        rf.set(1, Value::number(10.0));
        rf.set(2, Value::boolean(true));
        rf.set(3, Value::nil());

        assert_eq!(rf.get(0).as_number(), Some(42.0));
        assert_eq!(rf.get(1).as_number(), Some(10.0));
        assert_eq!(rf.get(2).as_bool(), Some(true));
        assert!(rf.get(3).is_nil());
    }

    #[test]
    fn get_set_reg_is_relative_to_frame_base() {
        let mut rf = RegisterFile::new();

        let base0 = rf.alloc_frame(3).unwrap();
        rf.set_reg(base0, 0, Value::number(100.0));
        rf.set_reg(base0, 1, Value::number(200.0));
        rf.set_reg(base0, 2, Value::number(300.0));

        let base1 = rf.alloc_frame(2).unwrap();
        rf.set_reg(base1, 0, Value::number(999.0));
        rf.set_reg(base1, 1, Value::number(888.0));

        assert_eq!(rf.get_reg(base0, 0).as_number(), Some(100.0));
        assert_eq!(rf.get_reg(base0, 1).as_number(), Some(200.0));
        assert_eq!(rf.get_reg(base0, 2).as_number(), Some(300.0));
        assert_eq!(rf.get_reg(base1, 0).as_number(), Some(999.0));
        assert_eq!(rf.get_reg(base1, 1).as_number(), Some(888.0));
    }

    #[test]
    fn get_slice_collects_consecutive_registers() {
        let mut rf = RegisterFile::new();
        let base = rf.alloc_frame(5).unwrap();

        for i in 0..5u8 {
            rf.set_reg(base, i, Value::number(i as f64 * 10.0));
        }

        let slice = rf.get_slice(base + 1, 3);
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].as_number(), Some(10.0));
        assert_eq!(slice[1].as_number(), Some(20.0));
        assert_eq!(slice[2].as_number(), Some(30.0));
    }

    #[test]
    fn copy_regs_moves_call_arguments() {
        let mut rf = RegisterFile::new();
        let base0 = rf.alloc_frame(4).unwrap();

        rf.set_reg(base0, 0, Value::number(1.0));
        rf.set_reg(base0, 1, Value::number(2.0));

        let base1 = rf.alloc_frame(3).unwrap();
        rf.copy_regs(base0, base1, 2);

        assert_eq!(rf.get_reg(base1, 0).as_number(), Some(1.0));
        assert_eq!(rf.get_reg(base1, 1).as_number(), Some(2.0));
        assert!(rf.get_reg(base1, 2).is_nil());
    }

    #[test]
    fn overflow_past_max_size_is_an_error() {
        let mut rf = RegisterFile::with_max_size(10);

        rf.alloc_frame(8).unwrap();
        rf.alloc_frame(2).unwrap();
        assert!(matches!(rf.alloc_frame(1), Err(RuntimeError::StackOverflow)));
    }

    #[test]
    fn frame_reuse_reinitializes_to_nil() {
        let mut rf = RegisterFile::new();

        let base = rf.alloc_frame(3).unwrap();
        rf.set(0, Value::number(42.0));
        rf.set(1, Value::number(43.0));
        rf.set(2, Value::number(44.0));

        rf.free_frame(base);
        let base2 = rf.alloc_frame(3).unwrap();
        assert_eq!(base2, 0);

        assert!(rf.get(0).is_nil());
        assert!(rf.get(1).is_nil());
        assert!(rf.get(2).is_nil());
    }

    #[test]
    fn stats_reflect_current_usage() {
        let mut rf = RegisterFile::new();
        rf.alloc_frame(10).unwrap();

        let stats = rf.stats();
        assert_eq!(stats.top, 10);
        assert!(stats.capacity >= 10);
        assert_eq!(stats.max_size, DEFAULT_MAX_SIZE);
    }
}
