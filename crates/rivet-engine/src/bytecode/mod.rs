//! Register bytecode: the opcode set and the 32-bit instruction encoding
//! the compiler emits into and the interpreter dispatches over.

pub mod instr;
pub mod opcode;

pub use instr::{BytecodeWriter, Instr, JMP_BIAS, JUMP_LIST_END, jump_list};
pub use opcode::Opcode;
