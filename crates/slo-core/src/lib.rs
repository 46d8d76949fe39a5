//! slo-core — the value representation, object model, and garbage collector
//! shared by the compiler and VM crates.
//!
//! Nothing in this crate parses or executes source; it exists so the
//! compiler and the VM agree on exactly one definition of a value, an
//! object, and a chunk of bytecode.

pub mod chunk;
pub mod error;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, LineTable, OpCode};
pub use error::CoreError;
pub use heap::Heap;
pub use object::{
    Arity, BoundMethodObj, ClassObj, ClosureObj, DictObj, EnumObj, FileMode, FileObj, FunctionObj,
    InstanceObj, ListObj, ModuleObj, NativeFn, NativeObj, Object, UpvalueLocation, UpvalueObj,
};
pub use table::Table;
pub use value::{ObjRef, Value};

/// Convenience re-exports for crates that only need the common types.
pub mod prelude {
    pub use crate::{Chunk, CoreError, Heap, ObjRef, Object, OpCode, Table, Value};
}
