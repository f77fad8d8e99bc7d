//! The runtime container: packages, the function table, the constants
//! pool, and the value stack, plus the public [`Error`] type surfaced to
//! embedders.

use std::path::{Path, PathBuf};

use crate::bytecode::Instr;
use crate::jit::JitStats;
use crate::value::Value;
use crate::vm::RegisterFile;

/// Reserved package identity used when a source-derived name is empty
/// (e.g. a path whose basename is just an extension).
pub const ANONYMOUS_PACKAGE: u64 = u64::MAX;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64-bit hash, used to derive a package's identity from its name.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Derives a package identity from a source file path: the basename with
/// its final extension stripped, hashed with FNV-1a, or [`ANONYMOUS_PACKAGE`]
/// if that basename is empty.
pub fn package_identity_from_path(path: &Path) -> u64 {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    package_identity_from_name(stem)
}

/// Derives a package identity directly from a name (used when a package is
/// created from an in-memory source string rather than a file).
pub fn package_identity_from_name(name: &str) -> u64 {
    if name.is_empty() {
        ANONYMOUS_PACKAGE
    } else {
        fnv1a(name.as_bytes())
    }
}

/// A named unit of compiled code.
#[derive(Debug, Clone)]
pub struct Package {
    /// FNV-1a hash of the source-derived name, or [`ANONYMOUS_PACKAGE`].
    pub identity: u64,
    /// Index into the runtime's function table of this package's entry
    /// point.
    pub main_function: u32,
}

/// A compiled function: append-only during compilation, immutable after.
#[derive(Debug, Clone, Default)]
pub struct Function {
    /// Index of the owning package.
    pub package: u32,
    /// Declared parameter count.
    pub arg_count: u8,
    /// High-water mark of register slots this function's body used — the
    /// frame size the interpreter allocates on call.
    pub max_slots: u8,
    /// The bytecode body.
    pub code: Vec<Instr>,
    /// Parallel to `code`: the source line each instruction was emitted
    /// for, consulted only when a runtime error is constructed.
    pub lines: Vec<u32>,
}

impl Function {
    pub fn new(package: u32, arg_count: u8) -> Self {
        Self {
            package,
            arg_count,
            max_slots: 0,
            code: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// The source line the instruction at `ip` was compiled from, if
    /// recorded.
    pub fn line_at(&self, ip: usize) -> Option<u32> {
        self.lines.get(ip).copied()
    }
}

/// Maximum number of unique constants a single runtime may intern — the
/// pool index is a 16-bit field.
pub const MAX_CONSTANTS: usize = 65_535;

/// Interned pool of literal values, deduplicated by bitwise equality and
/// shared process-wide (per runtime instance).
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    values: Vec<Value>,
}

/// Raised when a 65,536th unique constant would be interned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("too many constants (limit is {MAX_CONSTANTS})")]
pub struct ConstantPoolFull;

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `value`, returning its pool index. Existing entries are
    /// matched by the value's raw bit pattern, so `0.0` and `-0.0` (which
    /// compare unequal under `Value`'s `PartialEq`... actually equal, since
    /// equality here is bitwise) are distinct constants only when their
    /// bits differ.
    pub fn intern(&mut self, value: Value) -> Result<u16, ConstantPoolFull> {
        if let Some(idx) = self.values.iter().position(|v| v.raw() == value.raw()) {
            return Ok(idx as u16);
        }
        if self.values.len() >= MAX_CONSTANTS {
            return Err(ConstantPoolFull);
        }
        self.values.push(value);
        Ok((self.values.len() - 1) as u16)
    }

    pub fn get(&self, index: u16) -> Option<Value> {
        self.values.get(index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The error object surfaced by the public entry points: a description, the
/// source file (if the program came from one), and a 1-based line number
/// when known.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{description}")]
pub struct Error {
    pub description: String,
    pub path: Option<PathBuf>,
    pub line: Option<u32>,
}

impl Error {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            path: None,
            line: None,
        }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }
}

/// Exclusive owner of every package, function, constant, and the register
/// file for one independent execution context. Runtimes never share memory
/// with one another.
pub struct Runtime {
    pub packages: Vec<Package>,
    pub functions: Vec<Function>,
    pub constants: ConstantPool,
    pub registers: RegisterFile,
    pub jit_stats: JitStats,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            packages: Vec::new(),
            functions: Vec::new(),
            constants: ConstantPool::new(),
            registers: RegisterFile::new(),
            jit_stats: JitStats::default(),
        }
    }

    /// Registers a new, empty package whose main function is also freshly
    /// allocated (with `arg_count = 0`). Returns the package index.
    pub fn new_package(&mut self, name: &str) -> u32 {
        let main_function = self.functions.len() as u32;
        self.functions.push(Function::new(self.packages.len() as u32, 0));
        let identity = package_identity_from_name(name);
        self.packages.push(Package {
            identity,
            main_function,
        });
        (self.packages.len() - 1) as u32
    }

    /// Allocates a new function owned by `package`, returning its index.
    pub fn new_function(&mut self, package: u32, arg_count: u8) -> u32 {
        self.functions.push(Function::new(package, arg_count));
        (self.functions.len() - 1) as u32
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_package_for_empty_name() {
        assert_eq!(package_identity_from_name(""), ANONYMOUS_PACKAGE);
    }

    #[test]
    fn package_identity_is_fnv1a() {
        // FNV-1a("hello") with offset basis/prime above.
        assert_eq!(fnv1a(b"hello"), 0x0a43_0529_2b93_6a7e);
    }

    #[test]
    fn constant_pool_dedups_by_bits() {
        let mut pool = ConstantPool::new();
        let a = pool.intern(Value::number(3.0)).unwrap();
        let b = pool.intern(Value::number(4.0)).unwrap();
        let c = pool.intern(Value::number(3.0)).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn constant_pool_rejects_past_limit() {
        let mut pool = ConstantPool::new();
        for i in 0..MAX_CONSTANTS {
            pool.intern(Value::number(i as f64)).unwrap();
        }
        assert!(pool.intern(Value::number(MAX_CONSTANTS as f64)).is_err());
    }

    #[test]
    fn runtime_new_package_allocates_a_main_function() {
        let mut rt = Runtime::new();
        let pkg = rt.new_package("main");
        let pkg_obj = &rt.packages[pkg as usize];
        assert_eq!(pkg_obj.main_function as usize, 0);
        assert_eq!(rt.functions.len(), 1);
    }
}
