//! vm.rs — the stack-based bytecode interpreter (§4.3).
//!
//! A classic call-threaded switch dispatch loop: one `Vm` owns the heap,
//! the value stack, the call-frame stack, and the globals tables. Nothing
//! here allocates without first collecting `gc_roots()` — any freshly
//! built value must be reachable before it can trigger the next GC (§5).

use std::path::Path;

use slo_core::{
    Arity, ClosureObj, Heap, NativeFn, ObjRef, OpCode, Object, Table, UpvalueLocation, Value,
};

use crate::error::{RuntimeError, TraceFrame, VmError};
use crate::format::display_value;
use crate::natives;

const FRAMES_MAX: usize = 256;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slot_base: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Option<ObjRef>,
    globals: Table,
    global_finals: Table,
    builtin_classes: Vec<ObjRef>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

enum PropLookup {
    Field(Value),
    Method(ObjRef),
    ModuleValue(Value),
    Missing,
    NotAnObject,
}

enum InvokeTarget {
    Field(Value),
    Method(ObjRef),
}

enum IndexOutcome {
    Direct(Value),
    NeedsIntern(String),
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut globals = Table::new();
        natives::register_all(&mut heap, &mut globals);
        let builtin_classes = Self::init_builtin_classes(&mut heap);
        Self {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: None,
            globals,
            global_finals: Table::new(),
            builtin_classes,
        }
    }

    fn init_builtin_classes(heap: &mut Heap) -> Vec<ObjRef> {
        ["List", "Dict", "String", "File"]
            .iter()
            .map(|name| {
                let name_ref = heap.intern_string(name, &[]);
                heap.alloc_class(name_ref, &[])
            })
            .collect()
    }

    pub fn set_gc_stress(&mut self, on: bool) {
        self.heap.stress_gc = on;
    }

    pub fn set_gc_log(&mut self, on: bool) {
        self.heap.log_gc = on;
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Looks up a global by name, interning it first if needed. Exists for
    /// embedders and tests that want to inspect a program's results without
    /// going through `print`.
    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let key = self.intern(name);
        let hash = self.heap.hash_value(&Value::Obj(key));
        self.globals.get(hash, &Value::Obj(key)).cloned()
    }

    /// Compiles and runs `source`, returning the value left by its
    /// (implicit) top-level return. Leaves the VM's globals intact so a
    /// REPL can call this repeatedly against the same `Vm`.
    pub fn interpret(&mut self, source: &str, source_file: &str) -> Result<Value, VmError> {
        let func_ref = slo_compiler::compile_str(source, source_file, &mut self.heap)?;
        let roots = vec![Value::Obj(func_ref)];
        let closure_ref =
            self.heap.alloc_closure(ClosureObj { function: func_ref, upvalues: Vec::new() }, &roots);
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base: 0 });
        let result = self.run()?;
        Ok(result)
    }

    // ---- GC rooting -----------------------------------------------------

    fn gc_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = self.stack.clone();
        for frame in &self.frames {
            roots.push(Value::Obj(frame.closure));
        }
        let mut cur = self.open_upvalues;
        while let Some(r) = cur {
            roots.push(Value::Obj(r));
            cur = match self.heap.get(r) {
                Object::Upvalue(u) => u.next_open,
                _ => None,
            };
        }
        self.globals.for_each(|k, v| {
            roots.push(k.clone());
            roots.push(v.clone());
        });
        self.global_finals.for_each(|k, v| {
            roots.push(k.clone());
            roots.push(v.clone());
        });
        for c in &self.builtin_classes {
            roots.push(Value::Obj(*c));
        }
        roots
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        let roots = self.gc_roots();
        self.heap.intern_string(s, &roots)
    }

    fn string_value(&self, r: ObjRef) -> String {
        self.heap.get(r).as_string().unwrap_or("").to_string()
    }

    // ---- bytecode cursor --------------------------------------------------

    fn chunk_byte(&self, closure_ref: ObjRef, ip: usize) -> u8 {
        match self.heap.get(closure_ref) {
            Object::Closure(c) => match self.heap.get(c.function) {
                Object::Function(f) => f.chunk.code[ip],
                _ => unreachable!("closure.function must be a Function"),
            },
            _ => unreachable!("frame.closure must be a Closure"),
        }
    }

    fn chunk_u16(&self, closure_ref: ObjRef, ip: usize) -> u16 {
        match self.heap.get(closure_ref) {
            Object::Closure(c) => match self.heap.get(c.function) {
                Object::Function(f) => f.chunk.read_u16(ip),
                _ => unreachable!("closure.function must be a Function"),
            },
            _ => unreachable!("frame.closure must be a Closure"),
        }
    }

    fn read_u8(&mut self) -> u8 {
        let idx = self.frames.len() - 1;
        let closure_ref = self.frames[idx].closure;
        let ip = self.frames[idx].ip;
        let byte = self.chunk_byte(closure_ref, ip);
        self.frames[idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let idx = self.frames.len() - 1;
        let closure_ref = self.frames[idx].closure;
        let ip = self.frames[idx].ip;
        let val = self.chunk_u16(closure_ref, ip);
        self.frames[idx].ip += 2;
        val
    }

    fn read_constant(&self, idx: u8) -> Value {
        let frame = self.frames.last().expect("at least one frame");
        match self.heap.get(frame.closure) {
            Object::Closure(c) => match self.heap.get(c.function) {
                Object::Function(f) => f.chunk.constants[idx as usize].clone(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    fn function_info(&self, closure_ref: ObjRef) -> (String, String) {
        match self.heap.get(closure_ref) {
            Object::Closure(c) => match self.heap.get(c.function) {
                Object::Function(f) => {
                    let name = match f.name {
                        Some(n) => self.string_value(n),
                        None => "<script>".to_string(),
                    };
                    (name, f.source_file.clone())
                }
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    fn current_source_file(&self) -> String {
        let closure_ref = self.frames.last().expect("at least one frame").closure;
        self.function_info(closure_ref).1
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|fr| {
                let (name, file) = self.function_info(fr.closure);
                let line = self.chunk_byte_line(fr.closure, fr.ip.saturating_sub(1));
                TraceFrame { function_name: name, source_file: file, line }
            })
            .collect()
    }

    fn chunk_byte_line(&self, closure_ref: ObjRef, ip: usize) -> u32 {
        match self.heap.get(closure_ref) {
            Object::Closure(c) => match self.heap.get(c.function) {
                Object::Function(f) => f.chunk.lines.line_for(ip as u32),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError { message: message.into(), trace: self.build_trace() }
    }

    // ---- stack helpers ------------------------------------------------

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow is a compiler bug")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    // ---- upvalues -------------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cur = self.open_upvalues;
        while let Some(r) = cur {
            let loc = match self.heap.get(r) {
                Object::Upvalue(u) => u.location,
                _ => unreachable!(),
            };
            match loc {
                UpvalueLocation::Open(idx) if idx == stack_index => return r,
                UpvalueLocation::Open(idx) if idx < stack_index => break,
                _ => {}
            }
            prev = cur;
            cur = match self.heap.get(r) {
                Object::Upvalue(u) => u.next_open,
                _ => None,
            };
        }

        let roots = self.gc_roots();
        let new_ref = self.heap.alloc_upvalue(stack_index, &roots);
        if let Object::Upvalue(u) = self.heap.get_mut(new_ref) {
            u.next_open = cur;
        }
        match prev {
            Some(p) => {
                if let Object::Upvalue(u) = self.heap.get_mut(p) {
                    u.next_open = Some(new_ref);
                }
            }
            None => self.open_upvalues = Some(new_ref),
        }
        new_ref
    }

    /// Closes every open upvalue pointing at `stack_index` or higher.
    fn close_upvalues_from(&mut self, stack_index: usize) {
        while let Some(r) = self.open_upvalues {
            let idx = match self.heap.get(r) {
                Object::Upvalue(u) => match u.location {
                    UpvalueLocation::Open(i) => i,
                    UpvalueLocation::Closed => break,
                },
                _ => unreachable!(),
            };
            if idx < stack_index {
                break;
            }
            let value = self.stack[idx].clone();
            let next = match self.heap.get(r) {
                Object::Upvalue(u) => u.next_open,
                _ => None,
            };
            if let Object::Upvalue(u) = self.heap.get_mut(r) {
                u.closed = value;
                u.location = UpvalueLocation::Closed;
                u.next_open = None;
            }
            self.open_upvalues = next;
        }
    }

    fn read_upvalue(&self, r: ObjRef) -> Value {
        match self.heap.get(r) {
            Object::Upvalue(u) => match u.location {
                UpvalueLocation::Open(i) => self.stack[i].clone(),
                UpvalueLocation::Closed => u.closed.clone(),
            },
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, r: ObjRef, value: Value) {
        let loc = match self.heap.get(r) {
            Object::Upvalue(u) => u.location,
            _ => unreachable!(),
        };
        match loc {
            UpvalueLocation::Open(i) => self.stack[i] = value,
            UpvalueLocation::Closed => {
                if let Object::Upvalue(u) = self.heap.get_mut(r) {
                    u.closed = value;
                }
            }
        }
    }

    // ---- calls ------------------------------------------------------------

    fn call_closure(&mut self, closure_ref: ObjRef, func_ref: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let arity = match self.heap.get(func_ref) {
            Object::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if arity != argc {
            return Err(self.runtime_error(format!("expected {arity} arguments but got {argc}")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("stack overflow"));
        }
        let slot_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base });
        Ok(())
    }

    fn find_method(&self, class_ref: ObjRef, name: ObjRef) -> Option<ObjRef> {
        let mut current = Some(class_ref);
        let key = Value::Obj(name);
        while let Some(cr) = current {
            match self.heap.get(cr) {
                Object::Class(c) => {
                    if let Some(Value::Obj(m)) = self.heap.table_get(&c.methods, &key) {
                        return Some(*m);
                    }
                    current = c.superclass;
                }
                _ => return None,
            }
        }
        None
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let r = match &callee {
            Value::Obj(r) => *r,
            _ => return Err(self.runtime_error("can only call functions and classes")),
        };
        enum Kind {
            Closure(ObjRef),
            Bound(Value, ObjRef),
            Class(ObjRef),
            Native(NativeFn, Arity, String),
        }
        let kind = match self.heap.get(r) {
            Object::Closure(c) => Kind::Closure(c.function),
            Object::BoundMethod(b) => Kind::Bound(b.receiver.clone(), b.closure),
            Object::Class(_) => Kind::Class(r),
            Object::Native(n) => Kind::Native(n.func, n.arity, n.name.clone()),
            _ => return Err(self.runtime_error("can only call functions and classes")),
        };
        match kind {
            Kind::Closure(func_ref) => self.call_closure(r, func_ref, argc),
            Kind::Bound(receiver, closure_ref) => {
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = receiver;
                let func_ref = match self.heap.get(closure_ref) {
                    Object::Closure(c) => c.function,
                    _ => unreachable!(),
                };
                self.call_closure(closure_ref, func_ref, argc)
            }
            Kind::Class(class_ref) => {
                let roots = self.gc_roots();
                let instance_ref = self.heap.alloc_instance(class_ref, &roots);
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = Value::Obj(instance_ref);
                let init_name = self.intern("init");
                match self.find_method(class_ref, init_name) {
                    Some(init_closure) => {
                        let func_ref = match self.heap.get(init_closure) {
                            Object::Closure(c) => c.function,
                            _ => unreachable!(),
                        };
                        self.call_closure(init_closure, func_ref, argc)
                    }
                    None => {
                        if argc != 0 {
                            return Err(
                                self.runtime_error("expected 0 arguments for a class with no initializer")
                            );
                        }
                        Ok(())
                    }
                }
            }
            Kind::Native(func, arity, name) => {
                if !arity.accepts(argc) {
                    return Err(self.runtime_error(format!("wrong number of arguments to native '{name}'")));
                }
                let base = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[base..].to_vec();
                let result = func(&mut self.heap, &args);
                self.stack.truncate(base - 1);
                match result {
                    Value::Error(msg) => Err(self.runtime_error(msg.to_string())),
                    v => {
                        self.stack.push(v);
                        Ok(())
                    }
                }
            }
        }
    }

    fn bind_method(&mut self, receiver: Value, method_closure: ObjRef) -> ObjRef {
        let roots = self.gc_roots();
        self.heap.alloc_bound_method(receiver, method_closure, &roots)
    }

    // ---- property access ------------------------------------------------

    fn property_lookup(&self, receiver: &Value, name_ref: ObjRef) -> PropLookup {
        match receiver {
            Value::Obj(r) => match self.heap.get(*r) {
                Object::Instance(inst) => {
                    if let Some(v) = self.heap.table_get(&inst.fields, &Value::Obj(name_ref)) {
                        PropLookup::Field(v.clone())
                    } else {
                        match self.find_method(inst.class, name_ref) {
                            Some(m) => PropLookup::Method(m),
                            None => PropLookup::Missing,
                        }
                    }
                }
                Object::Module(m) => match self.heap.table_get(&m.methods, &Value::Obj(name_ref)) {
                    Some(v) => PropLookup::ModuleValue(v.clone()),
                    None => PropLookup::Missing,
                },
                _ => PropLookup::NotAnObject,
            },
            _ => PropLookup::NotAnObject,
        }
    }

    fn invoke_lookup(&self, receiver: &Value, name_ref: ObjRef) -> Result<InvokeTarget, RuntimeError> {
        let r = match receiver {
            Value::Obj(r) => *r,
            _ => return Err(self.runtime_error("only instances have methods")),
        };
        match self.heap.get(r) {
            Object::Instance(inst) => {
                if let Some(v) = self.heap.table_get(&inst.fields, &Value::Obj(name_ref)) {
                    Ok(InvokeTarget::Field(v.clone()))
                } else {
                    match self.find_method(inst.class, name_ref) {
                        Some(m) => Ok(InvokeTarget::Method(m)),
                        None => Err(
                            self.runtime_error(format!("undefined property '{}'", self.string_value(name_ref)))
                        ),
                    }
                }
            }
            _ => Err(self.runtime_error("only instances have methods")),
        }
    }

    fn set_property(&mut self, receiver: &Value, name_ref: ObjRef, value: Value) -> Result<(), RuntimeError> {
        let r = match receiver {
            Value::Obj(r) => *r,
            _ => return Err(self.runtime_error("only instances have settable fields")),
        };
        if !matches!(self.heap.get(r), Object::Instance(_)) {
            return Err(self.runtime_error("only instances have settable fields"));
        }
        let hash = self.heap.hash_value(&Value::Obj(name_ref));
        if let Object::Instance(inst) = self.heap.get_mut(r) {
            inst.fields.set(hash, Value::Obj(name_ref), value);
        }
        Ok(())
    }

    // ---- indexing ---------------------------------------------------------

    fn wrap_index(n: f64, len: usize) -> Option<usize> {
        let mut i = n as i64;
        if i < 0 {
            i += len as i64;
        }
        if i < 0 || i as usize >= len {
            None
        } else {
            Some(i as usize)
        }
    }

    fn slice_bound(&self, v: &Value, len: usize, default: usize) -> Result<usize, RuntimeError> {
        match v {
            Value::Nil => Ok(default),
            Value::Number(n) => {
                let mut i = *n as i64;
                if i < 0 {
                    i += len as i64;
                }
                Ok(i.clamp(0, len as i64) as usize)
            }
            _ => Err(self.runtime_error("slice bound must be a number or nil")),
        }
    }

    fn index_read(&self, container: &Value, index: &Value) -> Result<IndexOutcome, RuntimeError> {
        let r = match container {
            Value::Obj(r) => *r,
            _ => return Err(self.runtime_error("value is not indexable")),
        };
        match self.heap.get(r) {
            Object::List(l) => {
                let n = match index {
                    Value::Number(n) => *n,
                    _ => return Err(self.runtime_error("list index must be a number")),
                };
                let idx = Self::wrap_index(n, l.elements.len())
                    .ok_or_else(|| self.runtime_error("index out of range"))?;
                Ok(IndexOutcome::Direct(l.elements[idx].clone()))
            }
            Object::Dict(d) => match self.heap.table_get(&d.table, index) {
                Some(v) => Ok(IndexOutcome::Direct(v.clone())),
                None => Err(self.runtime_error("key not found")),
            },
            Object::String { bytes, .. } => {
                let n = match index {
                    Value::Number(n) => *n,
                    _ => return Err(self.runtime_error("string index must be a number")),
                };
                let chars: Vec<char> = bytes.chars().collect();
                let idx = Self::wrap_index(n, chars.len())
                    .ok_or_else(|| self.runtime_error("index out of range"))?;
                Ok(IndexOutcome::NeedsIntern(chars[idx].to_string()))
            }
            _ => Err(self.runtime_error("value is not indexable")),
        }
    }

    fn index_set(&mut self, container: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
        let r = match container {
            Value::Obj(r) => *r,
            _ => return Err(self.runtime_error("value is not indexable")),
        };
        enum Kind {
            List(usize),
            Dict,
            String,
        }
        let kind = match self.heap.get(r) {
            Object::List(l) => Kind::List(l.elements.len()),
            Object::Dict(_) => Kind::Dict,
            Object::String { .. } => Kind::String,
            _ => return Err(self.runtime_error("value is not indexable")),
        };
        match kind {
            Kind::List(len) => {
                let n = match index {
                    Value::Number(n) => *n,
                    _ => return Err(self.runtime_error("list index must be a number")),
                };
                let idx =
                    Self::wrap_index(n, len).ok_or_else(|| self.runtime_error("index out of range"))?;
                if let Object::List(l) = self.heap.get_mut(r) {
                    l.elements[idx] = value;
                }
                Ok(())
            }
            Kind::Dict => {
                let hash = self.heap.hash_value(index);
                if let Object::Dict(d) = self.heap.get_mut(r) {
                    d.table.set(hash, index.clone(), value);
                }
                Ok(())
            }
            Kind::String => Err(self.runtime_error("strings are immutable")),
        }
    }

    fn slice_value(&mut self, container: &Value, start: &Value, end: &Value) -> Result<Value, RuntimeError> {
        let r = match container {
            Value::Obj(r) => *r,
            _ => return Err(self.runtime_error("value is not sliceable")),
        };
        enum Data {
            List(Vec<Value>),
            Str(String),
        }
        let data = match self.heap.get(r) {
            Object::List(l) => {
                let len = l.elements.len();
                let s = self.slice_bound(start, len, 0)?;
                let e = self.slice_bound(end, len, len)?;
                Data::List(if s < e { l.elements[s..e].to_vec() } else { Vec::new() })
            }
            Object::String { bytes, .. } => {
                let chars: Vec<char> = bytes.chars().collect();
                let len = chars.len();
                let s = self.slice_bound(start, len, 0)?;
                let e = self.slice_bound(end, len, len)?;
                Data::Str(if s < e { chars[s..e].iter().collect() } else { String::new() })
            }
            _ => return Err(self.runtime_error("value is not sliceable")),
        };
        match data {
            Data::List(v) => {
                let roots = self.gc_roots();
                Ok(Value::Obj(self.heap.alloc_list(v, &roots)))
            }
            Data::Str(s) => Ok(Value::Obj(self.intern(&s))),
        }
    }

    fn contains_value(&self, container: &Value, item: &Value) -> Result<bool, RuntimeError> {
        match container {
            Value::Obj(r) => match self.heap.get(*r) {
                Object::List(l) => Ok(l.elements.iter().any(|v| v == item)),
                Object::Dict(d) => Ok(self.heap.table_get(&d.table, item).is_some()),
                Object::String { bytes, .. } => match item {
                    Value::Obj(ir) => match self.heap.get(*ir) {
                        Object::String { bytes: needle, .. } => Ok(bytes.contains(needle.as_str())),
                        _ => Err(self.runtime_error("'in' on a string requires a string operand")),
                    },
                    _ => Err(self.runtime_error("'in' on a string requires a string operand")),
                },
                _ => Err(self.runtime_error("right-hand side of 'in' must be a list, dict, or string")),
            },
            _ => Err(self.runtime_error("right-hand side of 'in' must be a list, dict, or string")),
        }
    }

    fn len_of(&self, v: &Value) -> Result<usize, RuntimeError> {
        match v {
            Value::Obj(r) => match self.heap.get(*r) {
                Object::String { bytes, .. } => Ok(bytes.chars().count()),
                Object::List(l) => Ok(l.elements.len()),
                Object::Dict(d) => Ok(d.table.len()),
                _ => Err(self.runtime_error("len() expects a string, list, or dict")),
            },
            _ => Err(self.runtime_error("len() expects a string, list, or dict")),
        }
    }

    // ---- imports ------------------------------------------------------

    fn import_module(&mut self, raw_path: &str, importer_source_file: &str) -> Result<Table, RuntimeError> {
        let base_dir = Path::new(importer_source_file).parent().unwrap_or_else(|| Path::new("."));
        let full_path = base_dir.join(raw_path);
        let source = std::fs::read_to_string(&full_path)
            .map_err(|e| self.runtime_error(format!("import failure: {e}")))?;
        let func_ref = slo_compiler::compile_str(&source, &full_path.display().to_string(), &mut self.heap)
            .map_err(|e| self.runtime_error(format!("import failure: {e}")))?;

        let saved_globals = std::mem::take(&mut self.globals);
        let saved_finals = std::mem::take(&mut self.global_finals);
        let saved_stack = std::mem::take(&mut self.stack);
        let saved_frames = std::mem::take(&mut self.frames);
        let saved_open_upvalues = self.open_upvalues.take();

        natives::register_all(&mut self.heap, &mut self.globals);
        let roots = vec![Value::Obj(func_ref)];
        let closure_ref =
            self.heap.alloc_closure(ClosureObj { function: func_ref, upvalues: Vec::new() }, &roots);
        self.stack.push(Value::Obj(closure_ref));
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slot_base: 0 });

        let run_result = self.run();

        let module_globals = std::mem::replace(&mut self.globals, saved_globals);
        self.global_finals = saved_finals;
        self.stack = saved_stack;
        self.frames = saved_frames;
        self.open_upvalues = saved_open_upvalues;

        run_result
            .map(|_| module_globals)
            .map_err(|e| self.runtime_error(format!("import failure: {}", e.message)))
    }

    // ---- the dispatch loop ----------------------------------------------

    fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let op_byte = self.read_u8();
            let op = OpCode::from_byte(op_byte).expect("invalid opcode byte: compiler/VM are out of sync");

            match op {
                OpCode::Constant => {
                    let idx = self.read_u8();
                    let v = self.read_constant(idx);
                    self.stack.push(v);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let v = self.peek(0).clone();
                    self.stack.push(v);
                }
                OpCode::Dup2 => {
                    let a = self.peek(1).clone();
                    let b = self.peek(0).clone();
                    self.stack.push(a);
                    self.stack.push(b);
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx);
                    let value = self.pop();
                    let hash = self.heap.hash_value(&name);
                    self.globals.set(hash, name, value);
                }
                OpCode::DefineFinalGlobal => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx);
                    let value = self.pop();
                    let hash = self.heap.hash_value(&name);
                    self.globals.set(hash, name.clone(), value);
                    self.global_finals.set(hash, name, Value::Bool(true));
                }
                OpCode::GetGlobal => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx);
                    let hash = self.heap.hash_value(&name);
                    match self.globals.get(hash, &name) {
                        Some(v) => {
                            let v = v.clone();
                            self.stack.push(v);
                        }
                        None => {
                            let name_str = match &name {
                                Value::Obj(r) => self.string_value(*r),
                                _ => "?".to_string(),
                            };
                            return Err(self.runtime_error(format!("undefined global '{name_str}'")));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let idx = self.read_u8();
                    let name = self.read_constant(idx);
                    let hash = self.heap.hash_value(&name);
                    if self.global_finals.get(hash, &name).is_some() {
                        return Err(self.runtime_error("cannot reassign a final global"));
                    }
                    if self.globals.get(hash, &name).is_none() {
                        return Err(self.runtime_error("undefined global"));
                    }
                    let value = self.peek(0).clone();
                    self.globals.set(hash, name, value);
                }
                OpCode::GetLocal => {
                    let slot = self.read_u8();
                    let base = self.frames.last().expect("frame").slot_base;
                    let v = self.stack[base + slot as usize].clone();
                    self.stack.push(v);
                }
                OpCode::SetLocal => {
                    let slot = self.read_u8();
                    let base = self.frames.last().expect("frame").slot_base;
                    let v = self.peek(0).clone();
                    self.stack[base + slot as usize] = v;
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_u8();
                    let closure_ref = self.frames.last().expect("frame").closure;
                    let uv_ref = match self.heap.get(closure_ref) {
                        Object::Closure(c) => c.upvalues[idx as usize],
                        _ => unreachable!(),
                    };
                    let v = self.read_upvalue(uv_ref);
                    self.stack.push(v);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_u8();
                    let closure_ref = self.frames.last().expect("frame").closure;
                    let uv_ref = match self.heap.get(closure_ref) {
                        Object::Closure(c) => c.upvalues[idx as usize],
                        _ => unreachable!(),
                    };
                    let v = self.peek(0).clone();
                    self.write_upvalue(uv_ref, v);
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues_from(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Bool(a != b));
                }
                OpCode::Greater | OpCode::GreaterEqual | OpCode::Less | OpCode::LessEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a.as_number(), b.as_number()) {
                        (Some(x), Some(y)) => {
                            let result = match op {
                                OpCode::Greater => x > y,
                                OpCode::GreaterEqual => x >= y,
                                OpCode::Less => x < y,
                                OpCode::LessEqual => x <= y,
                                _ => unreachable!(),
                            };
                            self.stack.push(Value::Bool(result));
                        }
                        _ => return Err(self.runtime_error("comparison operands must be numbers")),
                    }
                }
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.binary_numeric(|a, b| a - b, "-")?,
                OpCode::Multiply => self.binary_numeric(|a, b| a * b, "*")?,
                OpCode::Divide => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a.as_number(), b.as_number()) {
                        (Some(_), Some(y)) if y == 0.0 => return Err(self.runtime_error("division by zero")),
                        (Some(x), Some(y)) => self.stack.push(Value::Number(x / y)),
                        _ => return Err(self.runtime_error("operands to '/' must be numbers")),
                    }
                }
                OpCode::Modulo => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a.as_number(), b.as_number()) {
                        (Some(_), Some(y)) if y == 0.0 => return Err(self.runtime_error("division by zero")),
                        (Some(x), Some(y)) => self.stack.push(Value::Number(x % y)),
                        _ => return Err(self.runtime_error("operands to '%' must be numbers")),
                    }
                }
                OpCode::Pow => self.binary_numeric(|a, b| a.powf(b), "**")?,
                OpCode::Negate => {
                    let v = self.pop();
                    match v.as_number() {
                        Some(n) => self.stack.push(Value::Number(-n)),
                        None => return Err(self.runtime_error("operand to unary '-' must be a number")),
                    }
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.stack.push(Value::Bool(!v.is_truthy()));
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16();
                    if self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_u8();
                    let callee = self.peek(argc as usize).clone();
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name_idx = self.read_u8();
                    let argc = self.read_u8();
                    let name_ref = self.read_constant(name_idx).as_obj().expect("method name constant");
                    let receiver = self.peek(argc as usize).clone();
                    match self.invoke_lookup(&receiver, name_ref)? {
                        InvokeTarget::Field(v) => {
                            let base = self.stack.len() - argc as usize - 1;
                            self.stack[base] = v.clone();
                            self.call_value(v, argc)?;
                        }
                        InvokeTarget::Method(m) => {
                            let func_ref = match self.heap.get(m) {
                                Object::Closure(c) => c.function,
                                _ => unreachable!(),
                            };
                            self.call_closure(m, func_ref, argc)?;
                        }
                    }
                }
                OpCode::SuperInvoke => {
                    let name_idx = self.read_u8();
                    let argc = self.read_u8();
                    let name_ref = self.read_constant(name_idx).as_obj().expect("method name constant");
                    let superclass_val = self.pop();
                    let superclass_ref = superclass_val.as_obj().expect("superclass value");
                    match self.find_method(superclass_ref, name_ref) {
                        Some(m) => {
                            let func_ref = match self.heap.get(m) {
                                Object::Closure(c) => c.function,
                                _ => unreachable!(),
                            };
                            self.call_closure(m, func_ref, argc)?;
                        }
                        None => {
                            return Err(self.runtime_error(format!(
                                "undefined property '{}'",
                                self.string_value(name_ref)
                            )))
                        }
                    }
                }
                OpCode::Closure => {
                    let idx = self.read_u8();
                    let func_ref = self.read_constant(idx).as_obj().expect("function constant");
                    let upvalue_count = match self.heap.get(func_ref) {
                        Object::Function(f) => f.upvalue_count,
                        _ => unreachable!(),
                    };
                    let frame_base = self.frames.last().expect("frame").slot_base;
                    let enclosing_closure = self.frames.last().expect("frame").closure;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_u8() != 0;
                        let index = self.read_u8();
                        let uv_ref = if is_local {
                            self.capture_upvalue(frame_base + index as usize)
                        } else {
                            match self.heap.get(enclosing_closure) {
                                Object::Closure(c) => c.upvalues[index as usize],
                                _ => unreachable!(),
                            }
                        };
                        upvalues.push(uv_ref);
                    }
                    let roots = self.gc_roots();
                    let closure_ref = self.heap.alloc_closure(ClosureObj { function: func_ref, upvalues }, &roots);
                    self.stack.push(Value::Obj(closure_ref));
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame stack underflow");
                    self.close_upvalues_from(frame.slot_base);
                    self.stack.truncate(frame.slot_base);
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.stack.push(result);
                }
                OpCode::Class => {
                    let idx = self.read_u8();
                    let name_ref = self.read_constant(idx).as_obj().expect("class name constant");
                    let roots = self.gc_roots();
                    let class_ref = self.heap.alloc_class(name_ref, &roots);
                    self.stack.push(Value::Obj(class_ref));
                }
                OpCode::Method => {
                    let idx = self.read_u8();
                    let name_ref = self.read_constant(idx).as_obj().expect("method name constant");
                    let closure_val = self.pop();
                    let closure_ref = closure_val.as_obj().expect("method body must be a closure");
                    let class_ref = self.peek(0).as_obj().expect("class value under method");
                    let hash = self.heap.hash_value(&Value::Obj(name_ref));
                    if let Object::Class(c) = self.heap.get_mut(class_ref) {
                        c.methods.set(hash, Value::Obj(name_ref), Value::Obj(closure_ref));
                    }
                }
                OpCode::Inherit => {
                    let subclass_val = self.pop();
                    let subclass_ref = subclass_val.as_obj().expect("subclass value");
                    let superclass_val = self.peek(0).clone();
                    let superclass_ref = match &superclass_val {
                        Value::Obj(r) if matches!(self.heap.get(*r), Object::Class(_)) => *r,
                        _ => return Err(self.runtime_error("superclass must be a class")),
                    };
                    let pairs: Vec<(Value, Value)> = match self.heap.get(superclass_ref) {
                        Object::Class(c) => c.methods.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                        _ => unreachable!(),
                    };
                    let hashed: Vec<(u64, Value, Value)> =
                        pairs.into_iter().map(|(k, v)| (self.heap.hash_value(&k), k, v)).collect();
                    if let Object::Class(sub) = self.heap.get_mut(subclass_ref) {
                        sub.superclass = Some(superclass_ref);
                        for (h, k, v) in hashed {
                            sub.methods.set(h, k, v);
                        }
                    }
                }
                OpCode::GetSuper => {
                    let idx = self.read_u8();
                    let name_ref = self.read_constant(idx).as_obj().expect("method name constant");
                    let superclass_val = self.pop();
                    let superclass_ref = superclass_val.as_obj().expect("superclass value");
                    let receiver = self.pop();
                    match self.find_method(superclass_ref, name_ref) {
                        Some(m) => {
                            let bm = self.bind_method(receiver, m);
                            self.stack.push(Value::Obj(bm));
                        }
                        None => {
                            return Err(self.runtime_error(format!(
                                "undefined property '{}'",
                                self.string_value(name_ref)
                            )))
                        }
                    }
                }
                OpCode::GetProperty => {
                    let idx = self.read_u8();
                    let name_ref = self.read_constant(idx).as_obj().expect("property name constant");
                    let receiver = self.pop();
                    match self.property_lookup(&receiver, name_ref) {
                        PropLookup::Field(v) | PropLookup::ModuleValue(v) => self.stack.push(v),
                        PropLookup::Method(m) => {
                            let bm = self.bind_method(receiver, m);
                            self.stack.push(Value::Obj(bm));
                        }
                        PropLookup::Missing => {
                            return Err(self.runtime_error(format!(
                                "undefined property '{}'",
                                self.string_value(name_ref)
                            )))
                        }
                        PropLookup::NotAnObject => {
                            return Err(self.runtime_error("only instances and modules have properties"))
                        }
                    }
                }
                OpCode::SetProperty => {
                    let idx = self.read_u8();
                    let name_ref = self.read_constant(idx).as_obj().expect("property name constant");
                    let value = self.pop();
                    let receiver = self.pop();
                    self.set_property(&receiver, name_ref, value.clone())?;
                    self.stack.push(value);
                }
                OpCode::List => {
                    let count = self.read_u8();
                    let mut elems = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        elems.push(self.pop());
                    }
                    elems.reverse();
                    // `elems` no longer lives on the stack once popped, so
                    // `gc_roots()` alone can't see them: a collection
                    // triggered by this very allocation would sweep them.
                    // Root them explicitly until the list itself holds them.
                    let mut roots = self.gc_roots();
                    roots.extend(elems.iter().cloned());
                    let r = self.heap.alloc_list(elems, &roots);
                    self.stack.push(Value::Obj(r));
                }
                OpCode::Dict => {
                    let count = self.read_u8();
                    let mut pairs = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let v = self.pop();
                        let k = self.pop();
                        pairs.push((k, v));
                    }
                    pairs.reverse();
                    let mut table = Table::new();
                    for (k, v) in pairs {
                        let h = self.heap.hash_value(&k);
                        table.set(h, k, v);
                    }
                    // Same reasoning as `List`: the key/value pairs now live
                    // only in `table`, not on the stack, so they must be
                    // rooted explicitly for the allocation's own collection.
                    let mut roots = self.gc_roots();
                    table.for_each(|k, v| {
                        roots.push(k.clone());
                        roots.push(v.clone());
                    });
                    let r = self.heap.alloc_dict(table, &roots);
                    self.stack.push(Value::Obj(r));
                }
                OpCode::Enum => {
                    let count = self.read_u8();
                    let mut pairs = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let value = self.pop();
                        let name = self.pop();
                        pairs.push((name, value));
                    }
                    pairs.reverse();
                    let name_ref = self.pop().as_obj().expect("enum name constant");
                    let mut table = Table::new();
                    for (k, v) in pairs {
                        let h = self.heap.hash_value(&k);
                        table.set(h, k, v);
                    }
                    let mut roots = self.gc_roots();
                    roots.push(Value::Obj(name_ref));
                    table.for_each(|k, v| {
                        roots.push(k.clone());
                        roots.push(v.clone());
                    });
                    let r = self.heap.alloc_enum(name_ref, table, &roots);
                    self.stack.push(Value::Obj(r));
                }
                OpCode::GetIndex => {
                    let index = self.pop();
                    let container = self.pop();
                    let outcome = self.index_read(&container, &index)?;
                    let result = match outcome {
                        IndexOutcome::Direct(v) => v,
                        IndexOutcome::NeedsIntern(s) => Value::Obj(self.intern(&s)),
                    };
                    self.stack.push(result);
                }
                OpCode::SetIndex => {
                    let value = self.pop();
                    let index = self.pop();
                    let container = self.pop();
                    self.index_set(&container, &index, value.clone())?;
                    self.stack.push(value);
                }
                OpCode::Slice => {
                    let end = self.pop();
                    let start = self.pop();
                    let container = self.pop();
                    let result = self.slice_value(&container, &start, &end)?;
                    self.stack.push(result);
                }
                OpCode::Has | OpCode::HasNot => {
                    let container = self.pop();
                    let item = self.pop();
                    let found = self.contains_value(&container, &item)?;
                    let result = if op == OpCode::Has { found } else { !found };
                    self.stack.push(Value::Bool(result));
                }
                OpCode::Len => {
                    let v = self.pop();
                    let n = self.len_of(&v)?;
                    self.stack.push(Value::Number(n as f64));
                }
                OpCode::Import => {
                    let idx = self.read_u8();
                    let path_ref = self.read_constant(idx).as_obj().expect("import path constant");
                    let path_str = self.string_value(path_ref);
                    let importer_file = self.current_source_file();
                    let module_globals = self.import_module(&path_str, &importer_file)?;
                    let base_name = Path::new(&path_str)
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| path_str.clone());
                    // `module_globals` came back from a finished module run
                    // and isn't reachable from this VM's stack/frames/
                    // globals — same rooting gap as `List`/`Dict`/`Enum`.
                    let mut roots = self.gc_roots();
                    module_globals.for_each(|k, v| {
                        roots.push(k.clone());
                        roots.push(v.clone());
                    });
                    let module_ref = self.heap.alloc_module(base_name.clone(), module_globals, &roots);
                    let name_ref = self.intern(&base_name);
                    let hash = self.heap.hash_value(&Value::Obj(name_ref));
                    self.globals.set(hash, Value::Obj(name_ref), Value::Obj(module_ref));
                }
                OpCode::ImportAs => {
                    let path_idx = self.read_u8();
                    let bind_idx = self.read_u8();
                    let path_ref = self.read_constant(path_idx).as_obj().expect("import path constant");
                    let bind_ref = self.read_constant(bind_idx).as_obj().expect("import binding constant");
                    let path_str = self.string_value(path_ref);
                    let importer_file = self.current_source_file();
                    let module_globals = self.import_module(&path_str, &importer_file)?;
                    let display_name = self.string_value(bind_ref);
                    let mut roots = self.gc_roots();
                    module_globals.for_each(|k, v| {
                        roots.push(k.clone());
                        roots.push(v.clone());
                    });
                    let module_ref = self.heap.alloc_module(display_name, module_globals, &roots);
                    let hash = self.heap.hash_value(&Value::Obj(bind_ref));
                    self.globals.set(hash, Value::Obj(bind_ref), Value::Obj(module_ref));
                }
                OpCode::Interpolate => {
                    let count = self.read_u8();
                    let mut parts = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        parts.push(self.pop());
                    }
                    parts.reverse();
                    let mut s = String::new();
                    for p in &parts {
                        s.push_str(&display_value(&self.heap, p));
                    }
                    let r = self.intern(&s);
                    self.stack.push(Value::Obj(r));
                }
                OpCode::Assert => {
                    let v = self.pop();
                    if !v.is_truthy() {
                        return Err(self.runtime_error("assertion failed"));
                    }
                }
            }
        }
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => {
                self.stack.push(Value::Number(x + y));
                return Ok(());
            }
            _ => {}
        }
        if let (Value::Obj(ra), Value::Obj(rb)) = (&a, &b) {
            let strings = match (self.heap.get(*ra), self.heap.get(*rb)) {
                (Object::String { bytes: sa, .. }, Object::String { bytes: sb, .. }) => {
                    Some(format!("{sa}{sb}"))
                }
                _ => None,
            };
            if let Some(concat) = strings {
                let r = self.intern(&concat);
                self.stack.push(Value::Obj(r));
                return Ok(());
            }
            let lists = match (self.heap.get(*ra), self.heap.get(*rb)) {
                (Object::List(la), Object::List(lb)) => Some((la.elements.clone(), lb.elements.clone())),
                _ => None,
            };
            if let Some((mut la, lb)) = lists {
                la.extend(lb);
                // `a`/`b` are already off the stack, and `la`'s elements are
                // fresh clones reachable from nowhere else — root them for
                // the collection `alloc_list` may trigger, same as `List`.
                let mut roots = self.gc_roots();
                roots.extend(la.iter().cloned());
                let r = self.heap.alloc_list(la, &roots);
                self.stack.push(Value::Obj(r));
                return Ok(());
            }
        }
        Err(self.runtime_error("operands to '+' must both be numbers, strings, or lists"))
    }

    fn binary_numeric(&mut self, f: impl Fn(f64, f64) -> f64, op_name: &str) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.stack.push(Value::Number(f(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error(format!("operands to '{op_name}' must be numbers"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Vm, Value) {
        let mut vm = Vm::new();
        let result = vm.interpret(source, "<test>").expect("program should run");
        (vm, result)
    }

    #[test]
    fn arithmetic_precedence() {
        let (mut vm, _) = run("var result = 1 + 2 * 3;");
        assert_eq!(vm.get_global("result"), Some(Value::Number(7.0)));
    }

    #[test]
    fn interned_strings_compare_equal() {
        let (mut vm, _) = run(r#"var a = "hi"; var b = "hi"; var eq = a == b;"#);
        assert_eq!(vm.get_global("eq"), Some(Value::Bool(true)));
    }

    #[test]
    fn closures_share_a_captured_upvalue_across_calls() {
        let (mut vm, _) = run(
            "func make() { \
                 var x = 0; \
                 func inc() { x = x + 1; return x; } \
                 return inc; \
             } \
             var f = make(); \
             var r1 = f(); \
             var r2 = f(); \
             var r3 = f();",
        );
        assert_eq!(vm.get_global("r1"), Some(Value::Number(1.0)));
        assert_eq!(vm.get_global("r2"), Some(Value::Number(2.0)));
        assert_eq!(vm.get_global("r3"), Some(Value::Number(3.0)));
    }

    #[test]
    fn super_invoke_dispatches_to_the_parent_method() {
        let (mut vm, _) = run(
            "class A { greet() { return \"A\"; } } \
             class B extends A { greet() { return super.greet() + \"B\"; } } \
             var result = B().greet();",
        );
        match vm.get_global("result") {
            Some(Value::Obj(r)) => assert_eq!(vm.heap().get(r).as_string(), Some("AB")),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn list_index_assignment_and_len() {
        let (mut vm, _) = run(
            "var xs = [1, 2, 3]; \
             xs[1] = 9; \
             var a = xs[0]; \
             var b = xs[1]; \
             var c = xs[2]; \
             var n = len(xs);",
        );
        assert_eq!(vm.get_global("a"), Some(Value::Number(1.0)));
        assert_eq!(vm.get_global("b"), Some(Value::Number(9.0)));
        assert_eq!(vm.get_global("c"), Some(Value::Number(3.0)));
        assert_eq!(vm.get_global("n"), Some(Value::Number(3.0)));
    }

    #[test]
    fn for_loop_accumulates_the_expected_sum() {
        let (mut vm, _) = run(
            "var n = 0; \
             for (var i = 0; i < 1000; i = i + 1) { n = n + i; } ",
        );
        assert_eq!(vm.get_global("n"), Some(Value::Number(499500.0)));
    }

    #[test]
    fn failing_assertion_raises_a_runtime_error_with_a_trace() {
        let mut vm = Vm::new();
        let err = vm.interpret("var x = 1; assert(x == 2);", "<test>").expect_err("should fail");
        match err {
            VmError::Runtime(e) => {
                assert_eq!(e.message, "assertion failed");
                assert!(!e.trace.is_empty());
            }
            VmError::Compile(e) => panic!("expected a runtime error, got a compile error: {e}"),
        }
    }

    #[test]
    fn the_value_stack_is_empty_after_a_top_level_statement() {
        let (vm, _) = run("var a = 1; var b = a + 1;");
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn negative_indices_wrap_from_the_end_of_a_list() {
        let (mut vm, _) = run("var xs = [1, 2, 3]; var last = xs[-1];");
        assert_eq!(vm.get_global("last"), Some(Value::Number(3.0)));
    }

    #[test]
    fn slicing_clamps_out_of_range_bounds() {
        let (mut vm, _) = run("var xs = [1, 2, 3]; var ys = xs[0:100];");
        match vm.get_global("ys") {
            Some(Value::Obj(r)) => match vm.heap().get(r) {
                Object::List(l) => assert_eq!(l.elements.len(), 3),
                _ => panic!("expected a list"),
            },
            other => panic!("expected a list, got {other:?}"),
        }
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("var x = 1 / 0;", "<test>").expect_err("should fail");
        assert!(matches!(err, VmError::Runtime(_)));
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("print(never_declared);", "<test>").expect_err("should fail");
        assert!(matches!(err, VmError::Runtime(_)));
    }

    #[test]
    fn stress_gc_does_not_change_program_output() {
        let program = "var xs = []; \
             for (var i = 0; i < 200; i = i + 1) { xs = xs + [i]; } \
             var total = len(xs);";
        let (mut normal, _) = run(program);
        let mut stressed = Vm::new();
        stressed.set_gc_stress(true);
        stressed.interpret(program, "<test>").expect("program should run under stress GC");
        assert_eq!(normal.get_global("total"), stressed.get_global("total"));
    }
}
