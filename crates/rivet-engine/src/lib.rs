//! Rivet engine: a single-pass compiler, register virtual machine, and
//! tracing JIT recorder for a small dynamically-typed scripting language.
//!
//! - [`parser`] — tokenizer and string interning.
//! - [`compiler`] — the recursive-descent compiler that emits register
//!   bytecode directly while parsing, with no separate AST stage.
//! - [`bytecode`] — the 32-bit instruction encoding and bytecode writer.
//! - [`vm`] — the register file and the threaded-dispatch interpreter.
//! - [`jit`] — the tracing recorder, its IR, and linear-scan register
//!   allocation over that IR.
//! - [`runtime`] — packages, the function table, the constants pool, and
//!   the public [`runtime::Error`] type.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivet_engine::Runtime;
//!
//! let mut rt = Runtime::new();
//! let result = rt.run_str("main", "let x = 1 + 2;").unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod bytecode;
pub mod compiler;
pub mod jit;
pub mod parser;
pub mod runtime;
pub mod value;
pub mod vm;

pub use runtime::{Error, Runtime};
pub use value::Value;
