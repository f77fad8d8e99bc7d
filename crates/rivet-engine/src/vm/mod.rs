//! The register virtual machine: a flat register file, the interpreter's
//! dispatch loop, and the small runtime error taxonomy it raises.

pub mod interpreter;
pub mod register_file;

pub use interpreter::run;
pub use register_file::{RegisterFile, RegisterFileStats};

/// Errors the interpreter can raise while executing bytecode.
///
/// Kept deliberately small: the compiler guarantees well-formed register
/// indices and argument counts by construction, so most of what a stack
/// machine would call a "runtime error" simply cannot occur here. The one
/// case that can — a call chain deep enough to exhaust the register file —
/// is the only variant with real callers today; `InvalidOperand` is reserved
/// for the type checks a future, richer value set would need.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("register file exhausted (stack overflow)")]
    StackOverflow,

    #[error("invalid operand{}", .line.map(|l| format!(" at line {l}")).unwrap_or_default())]
    InvalidOperand { line: Option<u32> },
}

impl RuntimeError {
    pub fn line(&self) -> Option<u32> {
        match self {
            RuntimeError::StackOverflow => None,
            RuntimeError::InvalidOperand { line } => *line,
        }
    }
}

pub type VmResult<T> = Result<T, RuntimeError>;
