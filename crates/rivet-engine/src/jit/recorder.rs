//! Tracing: records the bytecode executed by a hot loop body into an
//! [`IrProgram`], stopping at a call (the language has no inlining story
//! here) or once the trace runs unreasonably long.
//!
//! This is the IR-lowering outline only: no machine code is emitted, but a
//! closed trace's `program` is real enough to feed [`crate::jit::regalloc`].
//! Relational checks are recorded as [`IrOp::GuardEq`] and friends — side
//! effects that abort the trace on failure, never ordinary CSE-eligible
//! values — and a loop-carried register that's rebound during the body gets
//! a [`IrOp::Phi`] merging its entry value with its end-of-iteration value
//! at the back edge.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::{Instr, Opcode};
use crate::jit::ir::{IrOp, IrProgram};
use crate::runtime::ConstantPool;

/// Caps how many bytecode instructions a single trace may record before
/// it's abandoned — a runaway loop shouldn't grow an unbounded IR buffer.
pub const MAX_TRACE_LEN: usize = 4096;

/// Why recording stopped without closing the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The trace hit a `CALL`; this tier doesn't trace across calls.
    Call,
    /// The trace recorded [`MAX_TRACE_LEN`] instructions without looping
    /// back to its header.
    TraceTooLong,
}

/// Result of [`Trace::start`].
pub enum RecorderOutcome {
    Started(Trace),
    Aborted(AbortReason),
}

/// An in-progress (or finished) recording of one loop body.
pub struct Trace {
    pub function: u32,
    pub header_ip: usize,
    pub program: IrProgram,
    /// Maps a bytecode register slot to the IR value index currently
    /// holding it, so a register read that's already in the trace becomes
    /// a reuse instead of a fresh `LoadReg`.
    reg_values: FxHashMap<u8, usize>,
    /// A slot's IR value index the first time it was read in this trace —
    /// the value a loop-carried register enters the body holding. Needed at
    /// the back edge to tell which rebound slots need a `Phi`.
    entry_loads: FxHashMap<u8, usize>,
    /// Slots rebound by `bind_reg` at least once during recording.
    written: FxHashSet<u8>,
    pub closed: bool,
}

impl Trace {
    /// Begins recording at a loop header. Always succeeds — aborting
    /// happens only once `record` sees something untraceable.
    pub fn start(function: u32, header_ip: usize) -> RecorderOutcome {
        RecorderOutcome::Started(Trace {
            function,
            header_ip,
            program: IrProgram::new(),
            reg_values: FxHashMap::default(),
            entry_loads: FxHashMap::default(),
            written: FxHashSet::default(),
            closed: false,
        })
    }

    fn load_reg(&mut self, slot: u8) -> usize {
        if let Some(&idx) = self.reg_values.get(&slot) {
            return idx;
        }
        let idx = self.program.push_value(IrOp::LoadReg, slot as u32, 0);
        self.reg_values.insert(slot, idx);
        self.entry_loads.entry(slot).or_insert(idx);
        idx
    }

    fn bind_reg(&mut self, slot: u8, value: usize) {
        self.reg_values.insert(slot, value);
        self.written.insert(slot);
        self.program.push_effect(IrOp::StoreReg, slot as u32, value as u32);
    }

    fn binop(&mut self, op: IrOp, left_slot: u8, right: u16, right_is_const: bool) -> usize {
        let left = self.load_reg(left_slot);
        let right = if right_is_const {
            self.program.push_value(IrOp::LoadConst, right as u32, 0)
        } else {
            self.load_reg(right as u8)
        };
        self.program.push_value(op, left as u32, right as u32)
    }

    /// Records a guard: a relational check that aborts the trace at runtime
    /// if it fails, rather than producing a value the trace can branch on.
    /// Unlike `binop`, never deduplicated — two identical guards at
    /// different points both have to fire.
    fn guard(&mut self, op: IrOp, left_slot: u8, right: u16, right_is_const: bool) {
        let left = self.load_reg(left_slot);
        let right = if right_is_const {
            self.program.push_value(IrOp::LoadConst, right as u32, 0)
        } else {
            self.load_reg(right as u8)
        };
        self.program.push_effect(op, left as u32, right as u32);
    }

    /// At the loop-closing back edge, every slot that's both read on entry
    /// and rebound somewhere in the body is loop-carried: the value it
    /// holds going into the next iteration isn't the one it entered this
    /// one with. Merge the two with a `Phi` so a consumer outside the trace
    /// can see both possible origins.
    fn close_loop_carried_phis(&mut self) {
        let mut slots: Vec<u8> = self
            .entry_loads
            .keys()
            .filter(|slot| self.written.contains(slot))
            .copied()
            .collect();
        slots.sort_unstable();
        for slot in slots {
            let entry = self.entry_loads[&slot];
            let current = self.reg_values[&slot];
            if current == entry {
                continue;
            }
            let phi = self.program.push_effect(IrOp::Phi, entry as u32, current as u32);
            self.reg_values.insert(slot, phi);
        }
    }

    /// Translates one executed instruction into IR. `ip` is the bytecode
    /// offset the instruction was fetched from, used only to detect the
    /// loop-closing back edge.
    pub fn record(&mut self, ip: usize, instr: Instr) -> Result<(), AbortReason> {
        if self.program.len() >= MAX_TRACE_LEN {
            return Err(AbortReason::TraceTooLong);
        }

        use Opcode::*;
        match instr.opcode() {
            Mov => {
                let v = self.load_reg(instr.d16() as u8);
                self.bind_reg(instr.a(), v);
            }
            SetN => {
                let v = self.program.push_value(IrOp::LoadConst, instr.d16() as u32, 0);
                self.bind_reg(instr.a(), v);
            }
            SetP => {
                let v = self.program.push_value(IrOp::LoadPrim, instr.d16() as u32, 0);
                self.bind_reg(instr.a(), v);
            }
            SetF => return Err(AbortReason::Call),

            AddLl => {
                let v = self.binop(IrOp::Add, instr.b(), instr.c() as u16, false);
                self.bind_reg(instr.a(), v);
            }
            AddLn => {
                let v = self.binop(IrOp::Add, instr.b(), instr.c() as u16, true);
                self.bind_reg(instr.a(), v);
            }
            SubLl => {
                let v = self.binop(IrOp::Sub, instr.b(), instr.c() as u16, false);
                self.bind_reg(instr.a(), v);
            }
            SubLn => {
                let v = self.binop(IrOp::Sub, instr.b(), instr.c() as u16, true);
                self.bind_reg(instr.a(), v);
            }
            SubNl => {
                // NUM - LOCAL: left operand is a constant, right is a register.
                let left = self.program.push_value(IrOp::LoadConst, instr.b() as u32, 0);
                let right = self.load_reg(instr.c());
                let v = self.program.push_value(IrOp::Sub, left as u32, right as u32);
                self.bind_reg(instr.a(), v);
            }
            MulLl => {
                let v = self.binop(IrOp::Mul, instr.b(), instr.c() as u16, false);
                self.bind_reg(instr.a(), v);
            }
            MulLn => {
                let v = self.binop(IrOp::Mul, instr.b(), instr.c() as u16, true);
                self.bind_reg(instr.a(), v);
            }
            DivLl => {
                let v = self.binop(IrOp::Div, instr.b(), instr.c() as u16, false);
                self.bind_reg(instr.a(), v);
            }
            DivLn => {
                let v = self.binop(IrOp::Div, instr.b(), instr.c() as u16, true);
                self.bind_reg(instr.a(), v);
            }
            DivNl => {
                let left = self.program.push_value(IrOp::LoadConst, instr.b() as u32, 0);
                let right = self.load_reg(instr.c());
                let v = self.program.push_value(IrOp::Div, left as u32, right as u32);
                self.bind_reg(instr.a(), v);
            }
            Neg => {
                let s = self.load_reg(instr.d16() as u8);
                let v = self.program.push_value(IrOp::Neg, s as u32, 0);
                self.bind_reg(instr.a(), v);
            }

            EqLl | NeqLl | LtLl | LeLl | GtLl | GeLl => {
                let op = guard_ir_op(instr.opcode());
                self.guard(op, instr.a(), instr.d16(), false);
            }
            EqLn | NeqLn | LtLn | LeLn | GtLn | GeLn => {
                let op = guard_ir_op(instr.opcode());
                self.guard(op, instr.a(), instr.d16(), true);
            }
            EqLp | NeqLp => {
                let op = guard_ir_op(instr.opcode());
                let left = self.load_reg(instr.a());
                let right = self.program.push_value(IrOp::LoadPrim, instr.d16() as u32, 0);
                self.program.push_effect(op, left as u32, right as u32);
            }

            Jmp => {}
            Loop => {
                if self.at_header(instr, ip) {
                    self.close_loop_carried_phis();
                    self.program.push_effect(IrOp::LoopBack, 0, 0);
                    self.closed = true;
                }
            }
            Call => return Err(AbortReason::Call),
            Ret => return Err(AbortReason::Call),
        }
        Ok(())
    }

    fn at_header(&self, instr: Instr, ip: usize) -> bool {
        let target = (ip as i64 + 1 + instr.jump_offset() as i64) as usize;
        target == self.header_ip
    }

    /// The constant-pool-backed values a finished trace's `LoadConst`
    /// entries refer to, resolved lazily by whoever consumes the trace.
    pub fn resolve_const(&self, constants: &ConstantPool, index: u32) -> Option<crate::value::Value> {
        constants.get(index as u16)
    }
}

fn guard_ir_op(op: Opcode) -> IrOp {
    use Opcode::*;
    match op {
        EqLl | EqLn | EqLp => IrOp::GuardEq,
        NeqLl | NeqLn | NeqLp => IrOp::GuardNeq,
        LtLl | LtLn => IrOp::GuardLt,
        LeLl | LeLn => IrOp::GuardLe,
        GtLl | GtLn => IrOp::GuardGt,
        GeLl | GeLn => IrOp::GuardGe,
        _ => unreachable!("guard_ir_op called on a non-relational opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instr;

    fn started(function: u32, header_ip: usize) -> Trace {
        match Trace::start(function, header_ip) {
            RecorderOutcome::Started(t) => t,
            RecorderOutcome::Aborted(_) => unreachable!(),
        }
    }

    #[test]
    fn records_a_simple_add_chain() {
        let mut t = started(0, 0);
        t.record(0, Instr::a_d16(Opcode::SetN, 0, 1)).unwrap();
        t.record(1, Instr::abc(Opcode::AddLl, 1, 0, 0)).unwrap();
        assert!(!t.program.is_empty());
        assert!(!t.closed);
    }

    #[test]
    fn call_aborts_the_trace() {
        let mut t = started(0, 0);
        let err = t.record(0, Instr::abc(Opcode::Call, 0, 1, 0)).unwrap_err();
        assert_eq!(err, AbortReason::Call);
    }

    #[test]
    fn reading_the_same_register_twice_is_deduplicated() {
        let mut t = started(0, 0);
        t.record(0, Instr::abc(Opcode::AddLl, 2, 0, 0)).unwrap();
        let len_after_first = t.program.len();
        t.record(1, Instr::abc(Opcode::SubLl, 3, 0, 0)).unwrap();
        // Both instructions read register 0 as their left operand; the
        // second shouldn't re-emit a LoadReg for it.
        assert!(t.program.len() <= len_after_first + 2);
    }

    #[test]
    fn loop_back_to_header_closes_the_trace() {
        let mut t = started(0, 5);
        // LOOP whose target (ip + 1 + offset) lands back on ip 5.
        let offset = 5i64 - (10i64 + 1);
        let instr = Instr::d24(Opcode::Loop, (offset + crate::bytecode::JMP_BIAS as i64) as u32);
        t.record(10, instr).unwrap();
        assert!(t.closed);
    }

    #[test]
    fn relational_opcodes_record_as_guards_not_values() {
        let mut t = started(0, 0);
        t.record(0, Instr::a_d16(Opcode::LtLl, 0, 1)).unwrap();
        let program = t.program.linearize();
        assert_eq!(program.last().unwrap().op(), IrOp::GuardLt);
    }

    #[test]
    fn identical_guards_are_never_deduplicated() {
        let mut t = started(0, 0);
        t.record(0, Instr::a_d16(Opcode::EqLl, 0, 1)).unwrap();
        let len_after_first = t.program.len();
        t.record(1, Instr::a_d16(Opcode::EqLl, 0, 1)).unwrap();
        // Same operands both times, but a guard has to fire on every pass.
        assert_eq!(t.program.len(), len_after_first + 1);
    }

    #[test]
    fn a_loop_carried_register_gets_a_phi_at_the_back_edge() {
        let mut t = started(0, 0);
        // r0 read on entry (the loop condition), then rebound inside the
        // body before the back edge — loop-carried.
        t.record(0, Instr::a_d16(Opcode::LtLn, 0, 0)).unwrap();
        t.record(1, Instr::abc(Opcode::AddLn, 0, 0, 1)).unwrap();

        let offset = 0i64 - (2i64 + 1);
        let instr = Instr::d24(Opcode::Loop, (offset + crate::bytecode::JMP_BIAS as i64) as u32);
        t.record(2, instr).unwrap();

        assert!(t.closed);
        let program = t.program.linearize();
        // The back edge is preceded by a Phi merging r0's entry value with
        // the value it was rebound to inside the body.
        let phi_pos = program.len() - 2;
        assert_eq!(program[phi_pos].op(), IrOp::Phi);
    }

    #[test]
    fn a_register_only_read_is_not_given_a_phi() {
        let mut t = started(0, 0);
        // r0 is read but never rebound in the body, so it isn't loop-carried.
        t.record(0, Instr::abc(Opcode::AddLl, 1, 0, 0)).unwrap();

        let offset = 0i64 - (1i64 + 1);
        let instr = Instr::d24(Opcode::Loop, (offset + crate::bytecode::JMP_BIAS as i64) as u32);
        t.record(1, instr).unwrap();

        assert!(t.closed);
        assert!(!t.program.linearize().iter().any(|i| i.op() == IrOp::Phi));
    }
}
