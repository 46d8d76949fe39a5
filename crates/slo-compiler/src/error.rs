//! error.rs — the compiler's error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Diagnostics(String),
    #[error("could not read source file: {0}")]
    Io(#[from] std::io::Error),
}
