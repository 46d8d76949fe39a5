//! heap.rs — allocation, string interning, and the mark-sweep collector (§4.4).
//!
//! Objects live in an arena (`Vec<Option<Entry>>`); an [`ObjRef`] is an
//! index into it. This stands in for the reference implementation's
//! intrusive linked list of heap objects (§9 design notes: "model handles
//! as arena indices into a single object store, with the store owning the
//! variants") — sweep is a single pass over the arena instead of a pointer
//! walk, but the observable behavior (unreachable objects are freed, live
//! ones are never moved or reused while referenced) is identical.
//!
//! The mark bit uses parity flipping (§9 open question): `next_gc_is_live`
//! toggles at the start of every collection, and an entry is live iff its
//! stored mark equals the heap's current `mark_value`.

use crate::object::{fnv1a_32, Arity, FileMode, Object};
use crate::table::Table;
use crate::value::{ObjRef, Value};

const GC_GROW_FACTOR: usize = 2;
const GC_HEAP_GROW_MIN: usize = 1 << 20; // floor ~1 MiB

struct Entry {
    object: Object,
    mark: bool,
    size: usize,
}

pub struct Heap {
    objects: Vec<Option<Entry>>,
    free_list: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    mark_value: bool,
    gray: Vec<ObjRef>,

    /// The interning table: keys are `Value::Obj(String)`, values are the
    /// unused sentinel `Bool(true)` — it is used purely as a set.
    pub strings: Table,

    pub stress_gc: bool,
    pub log_gc: bool,
    collections: u64,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_HEAP_GROW_MIN,
            mark_value: false,
            gray: Vec::new(),
            strings: Table::new(),
            stress_gc: false,
            log_gc: false,
            collections: 0,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    pub fn get(&self, r: ObjRef) -> &Object {
        self.objects[r.index()].as_ref().map(|e| &e.object).expect("dangling ObjRef")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        self.objects[r.index()].as_mut().map(|e| &mut e.object).expect("dangling ObjRef")
    }

    fn alloc_raw(&mut self, object: Object, size: usize) -> ObjRef {
        self.bytes_allocated += size;
        let entry = Entry { object, mark: self.mark_value, size };
        if let Some(idx) = self.free_list.pop() {
            self.objects[idx as usize] = Some(entry);
            ObjRef(idx)
        } else {
            let idx = self.objects.len() as u32;
            self.objects.push(Some(entry));
            ObjRef(idx)
        }
    }

    /// Allocates `object`, running a collection first if the allocation
    /// threshold (or stress mode) demands it. `extra_roots` are values the
    /// caller holds that aren't yet reachable from this heap's own tables
    /// (VM stack slots, frame closures, open upvalues, in-progress
    /// compiler functions) — see §5's rooting discipline.
    pub fn alloc(&mut self, object: Object, extra_roots: &[Value]) -> ObjRef {
        let size = Self::estimate_size(&object);
        if self.stress_gc || self.bytes_allocated + size > self.next_gc {
            self.collect_garbage(extra_roots);
        }
        self.alloc_raw(object, size)
    }

    fn estimate_size(object: &Object) -> usize {
        match object {
            Object::String { bytes, .. } => 24 + bytes.len(),
            Object::List(l) => 24 + l.elements.len() * std::mem::size_of::<Value>(),
            Object::Dict(d) => 24 + d.table.len() * std::mem::size_of::<Value>() * 2,
            _ => std::mem::size_of::<Object>(),
        }
    }

    // ---- hashing -----------------------------------------------------

    pub fn hash_value(&self, v: &Value) -> u64 {
        match v {
            Value::Nil => 0,
            Value::Bool(b) => *b as u64,
            Value::Number(n) => n.to_bits(),
            Value::Error(_) => 0,
            Value::Obj(r) => match self.get(*r) {
                Object::String { hash, .. } => *hash as u64,
                _ => r.0 as u64,
            },
        }
    }

    // ---- string interning ---------------------------------------------

    /// Interns `s`, returning the unique `ObjRef` for its byte sequence.
    /// Two calls with equal bytes always return the same `ObjRef`.
    pub fn intern_string(&mut self, s: &str, extra_roots: &[Value]) -> ObjRef {
        let hash = fnv1a_32(s.as_bytes());
        if let Some(existing) =
            self.strings.find_string(hash as u64, |r| self.get(r).as_string() == Some(s))
        {
            return existing;
        }
        let obj = Object::String { bytes: s.to_string(), hash };
        let r = self.alloc(obj, extra_roots);
        let key = Value::Obj(r);
        let key_hash = self.hash_value(&key);
        self.strings.set(key_hash, key, Value::Bool(true));
        r
    }

    // ---- typed allocation helpers --------------------------------------

    pub fn alloc_function(&mut self, f: crate::object::FunctionObj, roots: &[Value]) -> ObjRef {
        self.alloc(Object::Function(f), roots)
    }

    pub fn alloc_native(
        &mut self,
        name: impl Into<String>,
        arity: Arity,
        func: crate::object::NativeFn,
        roots: &[Value],
    ) -> ObjRef {
        self.alloc(
            Object::Native(crate::object::NativeObj { name: name.into(), arity, func }),
            roots,
        )
    }

    pub fn alloc_closure(&mut self, c: crate::object::ClosureObj, roots: &[Value]) -> ObjRef {
        self.alloc(Object::Closure(c), roots)
    }

    pub fn alloc_upvalue(&mut self, stack_index: usize, roots: &[Value]) -> ObjRef {
        self.alloc(Object::Upvalue(crate::object::UpvalueObj::open(stack_index)), roots)
    }

    pub fn alloc_class(&mut self, name: ObjRef, roots: &[Value]) -> ObjRef {
        self.alloc(Object::Class(crate::object::ClassObj::new(name)), roots)
    }

    pub fn alloc_instance(&mut self, class: ObjRef, roots: &[Value]) -> ObjRef {
        self.alloc(
            Object::Instance(crate::object::InstanceObj { class, fields: Table::new() }),
            roots,
        )
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, closure: ObjRef, roots: &[Value]) -> ObjRef {
        self.alloc(Object::BoundMethod(crate::object::BoundMethodObj { receiver, closure }), roots)
    }

    pub fn alloc_list(&mut self, elements: Vec<Value>, roots: &[Value]) -> ObjRef {
        self.alloc(Object::List(crate::object::ListObj { elements, class: None }), roots)
    }

    pub fn alloc_dict(&mut self, table: Table, roots: &[Value]) -> ObjRef {
        self.alloc(Object::Dict(crate::object::DictObj { table, class: None }), roots)
    }

    pub fn alloc_enum(&mut self, name: ObjRef, values: Table, roots: &[Value]) -> ObjRef {
        self.alloc(Object::Enum(crate::object::EnumObj { name, values }), roots)
    }

    pub fn alloc_module(&mut self, name: impl Into<String>, methods: Table, roots: &[Value]) -> ObjRef {
        self.alloc(Object::Module(crate::object::ModuleObj { name: name.into(), methods }), roots)
    }

    pub fn alloc_file(
        &mut self,
        name: impl Into<String>,
        mode: FileMode,
        handle: Option<std::fs::File>,
        roots: &[Value],
    ) -> ObjRef {
        self.alloc(
            Object::File(crate::object::FileObj { name: name.into(), mode, closed: false, handle }),
            roots,
        )
    }

    // ---- garbage collection --------------------------------------------

    fn mark_value(&mut self, v: &Value) {
        if let Value::Obj(r) = v {
            self.mark_obj(*r);
        }
    }

    fn mark_obj(&mut self, r: ObjRef) {
        let slot = match self.objects.get_mut(r.index()) {
            Some(Some(e)) => e,
            _ => return,
        };
        if slot.mark == self.mark_value {
            return;
        }
        slot.mark = self.mark_value;
        self.gray.push(r);
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            let mut children: Vec<Value> = Vec::new();
            match self.get(r) {
                Object::String { .. } | Object::Native(_) => {}
                Object::Function(f) => {
                    if let Some(n) = f.name {
                        children.push(Value::Obj(n));
                    }
                    children.extend(f.chunk.constants.iter().cloned());
                }
                Object::Closure(c) => {
                    children.push(Value::Obj(c.function));
                    children.extend(c.upvalues.iter().map(|u| Value::Obj(*u)));
                }
                Object::Upvalue(u) => {
                    if u.location == crate::object::UpvalueLocation::Closed {
                        children.push(u.closed.clone());
                    }
                }
                Object::Class(c) => {
                    children.push(Value::Obj(c.name));
                    if let Some(s) = c.superclass {
                        children.push(Value::Obj(s));
                    }
                    c.methods.for_each(|k, v| {
                        children.push(k.clone());
                        children.push(v.clone());
                    });
                }
                Object::Instance(i) => {
                    children.push(Value::Obj(i.class));
                    i.fields.for_each(|k, v| {
                        children.push(k.clone());
                        children.push(v.clone());
                    });
                }
                Object::BoundMethod(b) => {
                    children.push(b.receiver.clone());
                    children.push(Value::Obj(b.closure));
                }
                Object::List(l) => children.extend(l.elements.iter().cloned()),
                Object::Dict(d) => d.table.for_each(|k, v| {
                    children.push(k.clone());
                    children.push(v.clone());
                }),
                Object::Enum(e) => {
                    children.push(Value::Obj(e.name));
                    e.values.for_each(|k, v| {
                        children.push(k.clone());
                        children.push(v.clone());
                    });
                }
                Object::Module(m) => m.methods.for_each(|k, v| {
                    children.push(k.clone());
                    children.push(v.clone());
                }),
                Object::File(_) => {}
            }
            for child in &children {
                self.mark_value(child);
            }
        }
    }

    fn sweep_strings(&mut self) {
        let mark_value = self.mark_value;
        let objects = &self.objects;
        self.strings.remove_if(|k, _| match k {
            Value::Obj(r) => objects[r.index()].as_ref().map(|e| e.mark != mark_value).unwrap_or(true),
            _ => false,
        });
    }

    fn sweep_objects(&mut self) {
        let mark_value = self.mark_value;
        for idx in 0..self.objects.len() {
            let dead = match &self.objects[idx] {
                Some(e) => e.mark != mark_value,
                None => false,
            };
            if dead {
                if let Some(entry) = self.objects[idx].take() {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(entry.size);
                }
                self.free_list.push(idx as u32);
            }
        }
    }

    /// `extra_roots` must include everything the heap itself doesn't own:
    /// the VM's stack, its frames' closures, open upvalues, `globals`,
    /// `globalFinals`, and built-in class handles (§4.3 lists these as VM
    /// state, not heap state) — or, mid-compile, the compiler's
    /// in-progress constants (see `Compiler::gc_roots`).
    pub fn collect_garbage(&mut self, extra_roots: &[Value]) {
        self.mark_value = !self.mark_value;
        self.collections += 1;
        if self.log_gc {
            eprintln!("-- gc begin (collection #{})", self.collections);
        }

        for v in extra_roots {
            self.mark_value(v);
        }

        self.trace_references();
        self.sweep_strings();
        self.sweep_objects();

        self.next_gc = (self.bytes_allocated * GC_GROW_FACTOR).max(GC_HEAP_GROW_MIN);
        if self.log_gc {
            eprintln!(
                "-- gc end: {} bytes allocated, next at {}",
                self.bytes_allocated, self.next_gc
            );
        }
    }

    // ---- table convenience wrappers ------------------------------------

    pub fn table_set(&self, table: &mut Table, key: Value, value: Value) -> bool {
        let h = self.hash_value(&key);
        table.set(h, key, value)
    }

    pub fn table_get<'a>(&self, table: &'a Table, key: &Value) -> Option<&'a Value> {
        let h = self.hash_value(key);
        table.get(h, key)
    }

    pub fn table_delete(&self, table: &mut Table, key: &Value) -> bool {
        let h = self.hash_value(key);
        table.delete(h, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_equal_strings() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hi", &[]);
        let b = heap.intern_string("hi", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_strings_get_distinct_refs() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hi", &[]);
        let b = heap.intern_string("ho", &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        heap.stress_gc = true;
        let list = heap.alloc_list(vec![Value::Number(1.0)], &[]);
        // Not rooted anywhere; the next allocation triggers a sweep.
        let _other = heap.alloc_list(vec![], &[]);
        heap.collect_garbage(&[]);
        assert!(heap.objects[list.index()].is_none());
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let mut heap = Heap::new();
        let s = heap.intern_string("kept", &[]);
        let root = Value::Obj(s);
        heap.collect_garbage(std::slice::from_ref(&root));
        assert!(heap.objects[s.index()].is_some());
    }
}
