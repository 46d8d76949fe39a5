//! object.rs — heap object variants (§3 "Obj").
//!
//! Every variant listed in spec.md's Obj table has a corresponding struct
//! here. Cross-references between objects are by [`ObjRef`] handle, never
//! ownership — the [`crate::heap::Heap`] arena is the sole owner.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::{ObjRef, Value};

/// A bytecode function: arity, upvalue count, its own chunk, name, source.
#[derive(Debug, Clone)]
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
    pub source_file: String,
}

impl FunctionObj {
    pub fn new(name: Option<ObjRef>, source_file: impl Into<String>) -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
            source_file: source_file.into(),
        }
    }
}

/// Arity contract for a native function (§6, §9 open question on variadics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(u8),
    /// `arityMax == -1`: accept any argument count >= the minimum.
    AtLeast(u8),
    Range(u8, u8),
}

impl Arity {
    pub fn accepts(self, argc: u8) -> bool {
        match self {
            Arity::Exact(n) => argc == n,
            Arity::AtLeast(min) => argc >= min,
            Arity::Range(min, max) => argc >= min && argc <= max,
        }
    }
}

pub type NativeFn = fn(&mut crate::heap::Heap, &[Value]) -> Value;

#[derive(Clone)]
pub struct NativeObj {
    pub name: String,
    pub arity: Arity,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObj").field("name", &self.name).finish()
    }
}

/// A runtime pairing of a function with the upvalue cells it has captured.
#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Whether an upvalue still points at a live stack slot or owns its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueLocation {
    Open(usize),
    Closed,
}

/// A shared cell referenced by one or more closures.
#[derive(Debug, Clone)]
pub struct UpvalueObj {
    pub location: UpvalueLocation,
    pub closed: Value,
    /// Open-upvalue list, descending stack-address order; head is
    /// closest-to-top. Maintained by the VM, not by the GC.
    pub next_open: Option<ObjRef>,
}

impl UpvalueObj {
    pub fn open(stack_index: usize) -> Self {
        Self { location: UpvalueLocation::Open(stack_index), closed: Value::Nil, next_open: None }
    }
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: ObjRef,
    pub superclass: Option<ObjRef>,
    pub methods: Table,
    /// Read-only native properties exposed by built-in container classes
    /// (list, dict, string, file). Never user-writable.
    pub native_props: Table,
}

impl ClassObj {
    pub fn new(name: ObjRef) -> Self {
        Self { name, superclass: None, methods: Table::new(), native_props: Table::new() }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

#[derive(Debug, Clone)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub closure: ObjRef,
}

#[derive(Debug, Clone)]
pub struct ListObj {
    pub elements: Vec<Value>,
    pub class: Option<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct DictObj {
    pub table: Table,
    pub class: Option<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct EnumObj {
    pub name: ObjRef,
    pub values: Table,
}

/// The globals of an imported compilation unit, exposed as a namespace.
#[derive(Debug, Clone)]
pub struct ModuleObj {
    pub name: String,
    pub methods: Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

pub struct FileObj {
    pub name: String,
    pub mode: FileMode,
    pub closed: bool,
    pub handle: Option<std::fs::File>,
}

impl std::fmt::Debug for FileObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileObj")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("closed", &self.closed)
            .finish()
    }
}

/// The 13 object variants that make up the interpreter's heap vocabulary.
#[derive(Debug)]
pub enum Object {
    String { bytes: String, hash: u32 },
    Function(FunctionObj),
    Native(NativeObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    List(ListObj),
    Dict(DictObj),
    Enum(EnumObj),
    Module(ModuleObj),
    File(FileObj),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::String { .. } => "string",
            Object::Function(_) => "function",
            Object::Native(_) => "native",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "bound method",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Enum(_) => "enum",
            Object::Module(_) => "module",
            Object::File(_) => "file",
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Object::String { bytes, .. } => Some(bytes),
            _ => None,
        }
    }
}

/// FNV-1a over bytes, truncated to 32 bits (§3 String hash field).
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
