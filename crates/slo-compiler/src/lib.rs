//! slo-compiler — scanner and single-pass bytecode compiler (§4.1-4.2).
//!
//! Public entry points take source text plus a [`slo_core::Heap`] (the
//! compiler allocates string and function objects directly into it) and
//! return the top-level function's handle, ready for the VM to wrap in a
//! closure and run.

pub mod compiler;
pub mod diagnostics;
pub mod error;
pub mod scanner;

use std::path::Path;

use slo_core::{Heap, ObjRef};

pub use compiler::Compiler;
pub use diagnostics::{Diag, Diagnostics};
pub use error::CompileError;
pub use scanner::{Scanner, Token, TokenKind};

/// Compiles `source` (attributed to `source_file` in diagnostics and stack
/// traces) into a top-level function living in `heap`.
pub fn compile_str(
    source: &str,
    source_file: &str,
    heap: &mut Heap,
) -> Result<ObjRef, CompileError> {
    Compiler::compile(source, source_file, heap).map_err(|diags| CompileError::Diagnostics(diags.render()))
}

/// Reads `path` and compiles its contents, using the path as the source
/// file name for diagnostics.
pub fn compile_file(path: &Path, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let source = std::fs::read_to_string(path)?;
    compile_str(&source, &path.display().to_string(), heap)
}
