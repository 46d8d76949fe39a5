//! error.rs — structured errors raised by the value/object/heap layer.

use thiserror::Error;

/// Errors that originate below the compiler and VM: constant pool limits,
/// malformed bytecode, and heap invariants. Both `slo-compiler` and
/// `slo-vm` wrap this in their own error enums rather than matching on it
/// directly.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("function has more than 256 constants")]
    ConstantPoolFull,

    #[error("invalid opcode byte {0:#04x} at offset {1}")]
    InvalidOpcode(u8, usize),

    #[error("{what} handle does not refer to a live object")]
    DanglingRef { what: &'static str },
}
