//! Linear-scan register allocation over a recorded trace's IR values.
//!
//! Assigns each IR value index a slot in a fixed 16-register pool. Ties
//! (multiple free registers available at once) are broken by always taking
//! the lowest free index, so allocation is deterministic given the same
//! trace.

use rustc_hash::FxHashMap;

use crate::jit::ir::{self, IrInstr};

/// Size of the physical register pool a trace is allocated into.
pub const NUM_REGISTERS: usize = 16;

/// Raised when a trace needs more than [`NUM_REGISTERS`] live values at
/// once. The outline recorder has no spill mechanism, so this simply fails
/// allocation for that trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("trace needs more than {NUM_REGISTERS} live registers at once")]
pub struct OutOfRegisters;

/// One IR value's live range: the instruction index it's defined at, and
/// the last instruction index that reads it.
#[derive(Debug, Clone, Copy)]
struct Interval {
    value: usize,
    start: usize,
    end: usize,
}

/// The allocator's output: which physical register each IR value index
/// lives in.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    slots: FxHashMap<usize, u8>,
}

impl Allocation {
    pub fn slot_of(&self, value: usize) -> Option<u8> {
        self.slots.get(&value).copied()
    }
}

/// Computes each value's live interval from a linearized instruction list,
/// then assigns physical registers by classic linear scan: intervals sorted
/// by start, expiring registers whose interval has ended before handing out
/// a new one.
pub fn allocate(program: &[IrInstr]) -> Result<Allocation, OutOfRegisters> {
    let intervals = compute_intervals(program);

    let mut free: Vec<u8> = (0..NUM_REGISTERS as u8).rev().collect(); // pop() yields lowest first
    let mut active: Vec<(usize, u8)> = Vec::new(); // (end, register), sorted by end ascending
    let mut result = Allocation::default();

    for interval in &intervals {
        active.retain(|&(end, reg)| {
            if end < interval.start {
                free.push(reg);
                false
            } else {
                true
            }
        });
        free.sort_unstable_by(|a, b| b.cmp(a)); // keep pop() yielding the lowest index

        let reg = free.pop().ok_or(OutOfRegisters)?;
        active.push((interval.end, reg));
        result.slots.insert(interval.value, reg);
    }

    Ok(result)
}

/// `program` is indexed 0-based as a plain slice, but the IR reference
/// numbering it encodes is 1-based (see [`crate::jit::ir::NONE`]): the
/// instruction at slice position `p` is IR value `p + 1`. Only an
/// instruction's value-reference operands (per [`IrOp::value_operands`])
/// extend another value's live range — a load's `a`/`b` are a slot/constant/
/// primitive index, never a reference, and `NONE` (0) marks "no operand
/// here" so a unary op's padded-out `b` can't be mistaken for a use of
/// value 1.
fn compute_intervals(program: &[IrInstr]) -> Vec<Interval> {
    let mut start = vec![usize::MAX; program.len()];
    let mut end = vec![0usize; program.len()];

    for (pos, instr) in program.iter().enumerate() {
        let value = pos + 1;
        start[pos] = start[pos].min(value);
        let (a_is_ref, b_is_ref) = instr.op().value_operands();
        let refs = [(a_is_ref, instr.a()), (b_is_ref, instr.b())];
        for (is_ref, operand) in refs {
            if !is_ref || operand == ir::NONE {
                continue;
            }
            let ref_pos = operand as usize - 1;
            if ref_pos < program.len() {
                end[ref_pos] = end[ref_pos].max(value);
                if start[ref_pos] == usize::MAX {
                    start[ref_pos] = ref_pos + 1;
                }
            }
        }
    }

    let mut intervals: Vec<Interval> = (0..program.len())
        .map(|pos| {
            let value = pos + 1;
            Interval {
                value,
                start: start[pos].min(value),
                end: end[pos].max(value),
            }
        })
        .collect();
    intervals.sort_by_key(|i| i.start);
    intervals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::IrOp;

    #[test]
    fn disjoint_lifetimes_reuse_the_same_register() {
        // Value numbering is 1-based (index 0 is the `NONE` sentinel), so
        // this trace's three instructions are values 1, 2, and 3.
        let program = vec![
            IrInstr::new(IrOp::LoadConst, 0, 0), // value 1, dies at 2
            IrInstr::new(IrOp::Neg, 1, 0),       // value 2, uses value 1
            IrInstr::new(IrOp::LoadConst, 1, 0), // value 3, independent
        ];
        let alloc = allocate(&program).unwrap();
        assert_eq!(alloc.slot_of(1), Some(0));
        // value 3's lifetime starts after value 1 has expired, so it can
        // reuse register 0.
        assert_eq!(alloc.slot_of(3), Some(0));
    }

    #[test]
    fn a_loads_padding_field_is_never_mistaken_for_a_reference() {
        // Both loads' `b` fields are 0 (the `NONE` sentinel, and also what
        // used to be misread as "references value 0" before loads were
        // excluded from the live-range pass). Since the Add at the end
        // reads both of them, they must get distinct registers.
        let program = vec![
            IrInstr::new(IrOp::LoadConst, 1, 0), // value 1
            IrInstr::new(IrOp::LoadConst, 1, 0), // value 2
            IrInstr::new(IrOp::Add, 1, 2),        // value 3
        ];
        let alloc = allocate(&program).unwrap();
        assert_ne!(alloc.slot_of(1), alloc.slot_of(2));
    }

    #[test]
    fn more_than_sixteen_concurrently_live_values_fails() {
        let mut program = Vec::new();
        for k in 0..17 {
            program.push(IrInstr::new(IrOp::LoadConst, k, 0));
        }
        // Keep every loaded value (1..=17) alive by reading value 1 plus
        // one other in each of 16 Adds (only two operands fit per
        // instruction, so chain reads through value 1).
        for k in 2..=17u32 {
            program.push(IrInstr::new(IrOp::Add, 1, k));
        }
        assert!(allocate(&program).is_err());
    }
}
