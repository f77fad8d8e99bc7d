//! The threaded-dispatch register interpreter.
//!
//! "Threaded" here means the usual Rust shape for it: one `loop` over a
//! `match` on the opcode byte, relying on the compiler to turn that into a
//! jump table rather than a chain of comparisons. There is no separate
//! decode step — each arm reads its instruction's fields directly.
//!
//! Calls don't recurse into this function; a call pushes a [`Frame`] onto an
//! explicit stack and the same loop keeps running against whichever frame is
//! now on top. This keeps the interpreter's own native stack depth constant
//! regardless of how deep the interpreted call chain goes.

use crate::bytecode::{Instr, Opcode};
use crate::jit::recorder::{RecorderOutcome, Trace};
use crate::jit::regalloc;
use crate::runtime::{ConstantPool, Runtime};
use crate::value::Value;
use crate::vm::{RegisterFile, RuntimeError, VmResult};

/// Size of the fixed hotness-counter table every back edge indexes into.
/// Must be a power of two: the bucket is a masked shift of the target
/// instruction pointer, not a hash, so collisions between unrelated loops
/// are expected and simply reset or delay that loop's trace.
const HOT_COUNTERS: usize = 1024;
const HOT_THRESHOLD: u8 = 50;

struct Frame {
    function: u32,
    base: usize,
    ip: usize,
    /// Absolute register index in the *caller's* frame to receive this
    /// call's result, or `None` for the outermost frame `run` was called
    /// with.
    result_slot: Option<usize>,
}

/// Runs `function` with `args` (extra args beyond its declared parameter
/// count are ignored; missing ones read as `nil`), returning its result.
///
/// There is no `return` statement in this language tier — every call's
/// result is `nil` — but the signature returns a [`Value`] rather than `()`
/// so embedding call sites don't need to change if that grows later.
pub fn run(runtime: &mut Runtime, function: u32, args: &[Value]) -> VmResult<Value> {
    let Runtime { functions, constants, registers, jit_stats, .. } = runtime;
    let mut hot_counts = [0u8; HOT_COUNTERS];
    let mut active_trace: Option<Trace> = None;

    let base = registers.alloc_frame(functions[function as usize].max_slots as usize)?;
    for (i, &a) in args.iter().enumerate().take(functions[function as usize].arg_count as usize) {
        registers.set_reg(base, i as u8, a);
    }
    let mut frames = vec![Frame { function, base, ip: 0, result_slot: None }];

    loop {
        let (func_idx, ip, base) = {
            let top = frames.last().expect("frame stack never empties mid-loop");
            (top.function, top.ip, top.base)
        };
        let func = &functions[func_idx as usize];
        let instr = func.code[ip];
        frames.last_mut().unwrap().ip = ip + 1;

        // Feed the instruction about to run into any in-progress trace before
        // executing it, so the trace never sees the back edge that started
        // it (that instruction belongs to the iteration that triggered
        // `note_backward_edge`, not the body being recorded).
        let mut just_closed = false;
        if let Some(trace) = active_trace.as_mut() {
            if trace.function == func_idx {
                match trace.record(ip, instr) {
                    Ok(()) => just_closed = trace.closed,
                    Err(_abort) => active_trace = None,
                }
            } else {
                active_trace = None;
            }
        }
        if just_closed {
            let closed = active_trace.take().expect("just_closed implies a trace is present");
            match regalloc::allocate(&closed.program.linearize()) {
                Ok(_allocation) => jit_stats.traces_compiled += 1,
                Err(regalloc::OutOfRegisters) => jit_stats.traces_spilled += 1,
            }
        }

        match instr.opcode() {
            Opcode::Mov => {
                let v = registers.get_reg(base, instr.d16() as u8);
                registers.set_reg(base, instr.a(), v);
            }
            Opcode::SetN => {
                let v = constants
                    .get(instr.d16())
                    .expect("compiler only emits in-range constant indices");
                registers.set_reg(base, instr.a(), v);
            }
            Opcode::SetP => {
                registers.set_reg(base, instr.a(), prim_value(instr.d16() as u8));
            }
            Opcode::SetF => {
                registers.set_reg(base, instr.a(), Value::function(instr.d16() as u32));
            }

            Opcode::AddLl => arith(registers, constants, base, instr, false, false, |l, r| l + r),
            Opcode::AddLn => arith(registers, constants, base, instr, false, true, |l, r| l + r),
            Opcode::SubLl => arith(registers, constants, base, instr, false, false, |l, r| l - r),
            Opcode::SubLn => arith(registers, constants, base, instr, false, true, |l, r| l - r),
            Opcode::SubNl => arith(registers, constants, base, instr, true, false, |l, r| l - r),
            Opcode::MulLl => arith(registers, constants, base, instr, false, false, |l, r| l * r),
            Opcode::MulLn => arith(registers, constants, base, instr, false, true, |l, r| l * r),
            Opcode::DivLl => arith(registers, constants, base, instr, false, false, |l, r| l / r),
            Opcode::DivLn => arith(registers, constants, base, instr, false, true, |l, r| l / r),
            Opcode::DivNl => arith(registers, constants, base, instr, true, false, |l, r| l / r),
            Opcode::Neg => {
                let src = registers
                    .get_reg(base, instr.d16() as u8)
                    .as_number()
                    .expect("compiler rejects non-numeric unary operands");
                registers.set_reg(base, instr.a(), Value::number(-src));
            }

            Opcode::EqLl | Opcode::EqLn | Opcode::EqLp
            | Opcode::NeqLl | Opcode::NeqLn | Opcode::NeqLp
            | Opcode::LtLl | Opcode::LtLn
            | Opcode::LeLl | Opcode::LeLn
            | Opcode::GtLl | Opcode::GtLn
            | Opcode::GeLl | Opcode::GeLn => {
                if !relational(registers, constants, base, instr) {
                    // Condition false: skip the JMP that would otherwise follow.
                    frames.last_mut().unwrap().ip += 1;
                }
            }

            Opcode::Jmp => {
                let frame = frames.last_mut().unwrap();
                frame.ip = (frame.ip as i64 + instr.jump_offset() as i64) as usize;
            }
            Opcode::Loop => {
                let frame = frames.last_mut().unwrap();
                let target = (frame.ip as i64 + instr.jump_offset() as i64) as usize;
                note_backward_edge(&mut hot_counts, &mut active_trace, func_idx, target);
                frame.ip = target;
            }

            Opcode::Call => {
                let callee_val = registers.get_reg(base, instr.a());
                let callee_fn = callee_val.as_function().ok_or_else(|| {
                    RuntimeError::InvalidOperand { line: func.line_at(ip) }
                })?;
                let argc = instr.c() as usize;
                let arg_base = base + instr.b() as usize;
                let callee = &functions[callee_fn as usize];
                let new_base = registers.alloc_frame(callee.max_slots as usize)?;
                let copy_count = argc.min(callee.arg_count as usize);
                registers.copy_regs(arg_base, new_base, copy_count);
                frames.push(Frame {
                    function: callee_fn,
                    base: new_base,
                    ip: 0,
                    result_slot: Some(base + instr.a() as usize),
                });
            }
            Opcode::Ret => {
                let finished = frames.pop().expect("Ret always pops the frame it ran in");
                registers.free_frame(finished.base);
                match finished.result_slot {
                    None => return Ok(Value::nil()),
                    Some(slot) => registers.set(slot, Value::nil()),
                }
            }
        }
    }
}

#[inline]
fn prim_value(code: u8) -> Value {
    match code {
        0 => Value::nil(),
        2 => Value::boolean(false),
        3 => Value::boolean(true),
        other => unreachable!("invalid primitive code {other} in SET_P"),
    }
}

fn arith(
    registers: &mut RegisterFile,
    constants: &ConstantPool,
    base: usize,
    instr: Instr,
    l_const: bool,
    r_const: bool,
    op: impl Fn(f64, f64) -> f64,
) {
    let l = read_arith_operand(registers, constants, base, instr.b(), l_const);
    let r = read_arith_operand(registers, constants, base, instr.c(), r_const);
    registers.set_reg(base, instr.a(), Value::number(op(l, r)));
}

fn read_arith_operand(
    registers: &RegisterFile,
    constants: &ConstantPool,
    base: usize,
    idx: u8,
    is_const: bool,
) -> f64 {
    let v = if is_const {
        constants.get(idx as u16).expect("compiler only emits in-range constant indices")
    } else {
        registers.get_reg(base, idx)
    };
    v.as_number().expect("compiler rejects non-numeric arithmetic operands")
}

/// Compares `left`'s raw slot (always a register, per the operand calculus'
/// swap-left-if-const rule) against the right operand, which may be a
/// register, a constant, or a primitive depending on the opcode suffix.
/// Returns the comparison's boolean result.
fn relational(registers: &RegisterFile, constants: &ConstantPool, base: usize, instr: Instr) -> bool {
    let left = registers.get_reg(base, instr.a());
    let right = match instr.opcode() {
        Opcode::EqLp | Opcode::NeqLp => prim_value(instr.d16() as u8),
        Opcode::EqLn | Opcode::NeqLn | Opcode::LtLn | Opcode::LeLn | Opcode::GtLn | Opcode::GeLn => {
            constants.get(instr.d16()).expect("compiler only emits in-range constant indices")
        }
        _ => registers.get_reg(base, instr.d16() as u8),
    };
    match instr.opcode() {
        Opcode::EqLl | Opcode::EqLn | Opcode::EqLp => values_equal(left, right),
        Opcode::NeqLl | Opcode::NeqLn | Opcode::NeqLp => !values_equal(left, right),
        Opcode::LtLl | Opcode::LtLn => numeric(left) < numeric(right),
        Opcode::LeLl | Opcode::LeLn => numeric(left) <= numeric(right),
        Opcode::GtLl | Opcode::GtLn => numeric(left) > numeric(right),
        Opcode::GeLl | Opcode::GeLn => numeric(left) >= numeric(right),
        other => unreachable!("{other:?} is not a relational opcode"),
    }
}

#[inline]
fn numeric(v: Value) -> f64 {
    v.as_number().expect("compiler rejects non-numeric ordering operands")
}

/// Value equality: numeric comparison for numbers (so `0.0 == -0.0` and
/// `NaN != NaN` behave as IEEE-754 requires), bitwise for everything else
/// (primitives and function references are just tagged integers).
#[inline]
fn values_equal(a: Value, b: Value) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x == y,
        _ => a.raw() == b.raw(),
    }
}

fn note_backward_edge(
    hot_counts: &mut [u8; HOT_COUNTERS],
    active_trace: &mut Option<Trace>,
    function: u32,
    target_ip: usize,
) {
    if active_trace.is_some() {
        return;
    }
    let bucket = (target_ip >> 2) & (HOT_COUNTERS - 1);
    let count = &mut hot_counts[bucket];
    if *count < HOT_THRESHOLD {
        *count += 1;
        return;
    }
    match Trace::start(function, target_ip) {
        RecorderOutcome::Started(trace) => *active_trace = Some(trace),
        RecorderOutcome::Aborted(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeWriter;
    use crate::runtime::Runtime;

    fn push_ret(w: &mut BytecodeWriter) {
        w.emit(Instr::abc(Opcode::Ret, 0, 0, 0));
    }

    #[test]
    fn set_n_and_add_produce_a_number() {
        let mut rt = Runtime::new();
        let pkg = rt.new_package("main");
        let entry = rt.packages[pkg as usize].main_function;
        let c0 = rt.constants.intern(Value::number(3.0)).unwrap();
        let c1 = rt.constants.intern(Value::number(4.0)).unwrap();

        let mut w = BytecodeWriter::new();
        w.emit(Instr::a_d16(Opcode::SetN, 0, c0));
        w.emit(Instr::a_d16(Opcode::SetN, 1, c1));
        w.emit(Instr::abc(Opcode::AddLl, 2, 0, 1));
        push_ret(&mut w);
        rt.functions[entry as usize].code = w.finish();
        rt.functions[entry as usize].max_slots = 3;

        let result = super::run(&mut rt, entry, &[]).unwrap();
        assert!(result.is_nil());
        assert_eq!(rt.registers.top(), 0);
    }

    #[test]
    fn relational_skips_jump_on_false() {
        let mut rt = Runtime::new();
        let pkg = rt.new_package("main");
        let entry = rt.packages[pkg as usize].main_function;
        let c0 = rt.constants.intern(Value::number(1.0)).unwrap();
        let c1 = rt.constants.intern(Value::number(2.0)).unwrap();

        let mut w = BytecodeWriter::new();
        w.emit(Instr::a_d16(Opcode::SetN, 0, c0));
        w.emit(Instr::a_d16(Opcode::SetN, 1, c1));
        w.emit(Instr::a_d16(Opcode::EqLl, 0, 1));
        let jmp = w.emit(Instr::d24(Opcode::Jmp, 0));
        w.patch_jump(jmp, 99); // never taken since 1 != 2
        push_ret(&mut w);
        rt.functions[entry as usize].code = w.finish();
        rt.functions[entry as usize].max_slots = 2;

        super::run(&mut rt, entry, &[]).unwrap();
    }

    #[test]
    fn call_copies_args_and_returns_nil() {
        let mut rt = Runtime::new();
        let pkg = rt.new_package("main");
        let entry = rt.packages[pkg as usize].main_function;
        let callee = rt.new_function(pkg, 1);

        let mut callee_w = BytecodeWriter::new();
        push_ret(&mut callee_w);
        rt.functions[callee as usize].code = callee_w.finish();
        rt.functions[callee as usize].max_slots = 1;

        let mut w = BytecodeWriter::new();
        w.emit(Instr::a_d16(Opcode::SetF, 0, callee as u16));
        let c_arg = rt.constants.intern(Value::number(7.0)).unwrap();
        w.emit(Instr::a_d16(Opcode::SetN, 1, c_arg));
        w.emit(Instr::abc(Opcode::Call, 0, 1, 1));
        push_ret(&mut w);
        rt.functions[entry as usize].code = w.finish();
        rt.functions[entry as usize].max_slots = 2;

        let result = super::run(&mut rt, entry, &[]).unwrap();
        assert!(result.is_nil());
    }

    #[test]
    fn values_equal_treats_signed_zero_as_equal_and_nan_as_unequal() {
        assert!(values_equal(Value::number(0.0), Value::number(-0.0)));
        assert!(!values_equal(Value::number(f64::NAN), Value::number(f64::NAN)));
    }

    #[test]
    fn a_hot_loop_gets_traced_and_allocated() {
        let mut rt = Runtime::new();
        let pkg = rt.new_package("main");
        let entry = rt.packages[pkg as usize].main_function;
        let c_zero = rt.constants.intern(Value::number(0.0)).unwrap();
        let c_limit = rt.constants.intern(Value::number((HOT_THRESHOLD as f64) + 10.0)).unwrap();
        let c_one = rt.constants.intern(Value::number(1.0)).unwrap();

        let mut w = BytecodeWriter::new();
        w.emit(Instr::a_d16(Opcode::SetN, 0, c_zero)); // r0 = 0
        w.emit(Instr::a_d16(Opcode::SetN, 1, c_limit)); // r1 = limit
        let header = w.emit(Instr::a_d16(Opcode::LtLl, 0, 1)); // r0 < r1
        let exit_jmp = w.emit(Instr::d24(Opcode::Jmp, 0)); // taken while r0 < r1
        push_ret(&mut w); // falls here once r0 >= r1
        let body_start = w.position();
        w.emit(Instr::abc(Opcode::AddLn, 0, 0, c_one as u8)); // r0 += 1
        let loop_back = w.emit(Instr::d24(Opcode::Loop, 0));
        w.patch_jump(exit_jmp, body_start);
        w.patch_jump(loop_back, header);

        rt.functions[entry as usize].code = w.finish();
        rt.functions[entry as usize].max_slots = 2;

        super::run(&mut rt, entry, &[]).unwrap();
        assert!(rt.jit_stats.traces_compiled >= 1);
    }
}
