//! The embedding surface: compile-and-run entry points over [`Runtime`].
//!
//! These are thin — `run_str`/`run_file` exist so a caller never has to
//! touch `compiler::compile_source` or `vm::run` directly for the common
//! case of "run this whole program and give me its result."

use std::fs;
use std::path::Path;

use crate::compiler::compile_source;
use crate::runtime::{Error, Runtime};
use crate::value::Value;
use crate::vm;

impl Runtime {
    /// Compiles and runs `source` as a freshly named package, returning the
    /// result of its implicit top-level call.
    pub fn run_str(&mut self, name: &str, source: &str) -> Result<Value, Error> {
        let package = self.new_package(name);
        self.compile_and_run(package, source)
    }

    /// Reads `path`, then compiles and runs it the same way as [`Runtime::run_str`],
    /// deriving the package identity from the file's basename.
    pub fn run_file(&mut self, path: &Path) -> Result<Value, Error> {
        let source = fs::read_to_string(path).map_err(|e| {
            Error::new(format!("failed to read {}: {e}", path.display())).with_path(path.to_path_buf())
        })?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        let package = self.new_package(stem);
        self.compile_and_run(package, &source).map_err(|e| e.with_path(path.to_path_buf()))
    }

    fn compile_and_run(&mut self, package: u32, source: &str) -> Result<Value, Error> {
        compile_source(self, package, source).map_err(|e| {
            let mut err = Error::new(e.to_string());
            if let Some(line) = e.line() {
                err = err.with_line(line);
            }
            err
        })?;
        let main_function = self.packages[package as usize].main_function;
        vm::run(self, main_function, &[]).map_err(|e| {
            let mut err = Error::new(e.to_string());
            if let Some(line) = e.line() {
                err = err.with_line(line);
            }
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_str_executes_and_returns_nil() {
        let mut rt = Runtime::new();
        let result = rt.run_str("main", "let x = 1 + 2;").unwrap();
        assert!(result.is_nil());
    }

    #[test]
    fn run_str_surfaces_a_compile_error_with_a_line_number() {
        let mut rt = Runtime::new();
        let err = rt.run_str("main", "let x = ;").unwrap_err();
        assert_eq!(err.line, Some(1));
    }
}
