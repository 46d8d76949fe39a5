//! error.rs — runtime errors and their stack traces (§7).

use std::fmt;

use thiserror::Error;

/// One unwound call frame, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function_name: String,
    pub source_file: String,
    pub line: u32,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  at {} ({}:{})", self.function_name, self.source_file, self.line)
    }
}

/// A runtime error, with the stack trace captured while unwinding.
#[derive(Debug, Error)]
#[error("{message}\n{}", trace.iter().map(|t| t.to_string()).collect::<Vec<_>>().join("\n"))]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), trace: Vec::new() }
    }
}

/// Wraps both error classes the external CLI collaborator needs to map to
/// exit codes (§6): 65 for a failed compile, 70 for a runtime error.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{0}")]
    Compile(#[from] slo_compiler::CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
