//! natives.rs — the built-in function registry (§6).
//!
//! Each native is a plain `fn(&mut Heap, &[Value]) -> Value`; arity is
//! checked by the VM before the call using the `Arity` stored alongside it
//! in the `NativeObj`, so the bodies below trust `args.len()`.

use std::time::{SystemTime, UNIX_EPOCH};

use slo_core::{Arity, Heap, Value};

use crate::format::display_value;

pub fn register_all(heap: &mut Heap, globals: &mut slo_core::Table) {
    let mut define = |heap: &mut Heap, globals: &mut slo_core::Table, name: &str, arity: Arity, func: slo_core::NativeFn| {
        let r = heap.alloc_native(name, arity, func, &[]);
        let key = heap.intern_string(name, &[]);
        heap.table_set(globals, Value::Obj(key), Value::Obj(r));
    };

    define(heap, globals, "clock", Arity::Exact(0), native_clock);
    define(heap, globals, "time", Arity::Exact(0), native_clock);
    define(heap, globals, "sleep", Arity::Exact(1), native_sleep);
    define(heap, globals, "exit", Arity::Range(0, 1), native_exit);
    define(heap, globals, "print", Arity::AtLeast(0), native_print);
    define(heap, globals, "println", Arity::AtLeast(0), native_println);
    define(heap, globals, "len", Arity::Exact(1), native_len);
    define(heap, globals, "abs", Arity::Exact(1), native_abs);
    define(heap, globals, "min", Arity::AtLeast(1), native_min);
    define(heap, globals, "max", Arity::AtLeast(1), native_max);
}

fn native_clock(_heap: &mut Heap, _args: &[Value]) -> Value {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    Value::Number(now.as_secs_f64())
}

fn native_sleep(_heap: &mut Heap, args: &[Value]) -> Value {
    if let Value::Number(secs) = args[0] {
        if secs > 0.0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(secs));
        }
    }
    Value::Nil
}

fn native_exit(_heap: &mut Heap, args: &[Value]) -> Value {
    let code = match args.first() {
        Some(Value::Number(n)) => *n as i32,
        _ => 0,
    };
    std::process::exit(code);
}

fn native_print(heap: &mut Heap, args: &[Value]) -> Value {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            print!(" ");
        }
        print!("{}", display_value(heap, a));
    }
    Value::Nil
}

fn native_println(heap: &mut Heap, args: &[Value]) -> Value {
    native_print(heap, args);
    println!();
    Value::Nil
}

fn native_len(heap: &mut Heap, args: &[Value]) -> Value {
    match &args[0] {
        Value::Obj(r) => match heap.get(*r) {
            slo_core::Object::String { bytes, .. } => Value::Number(bytes.chars().count() as f64),
            slo_core::Object::List(l) => Value::Number(l.elements.len() as f64),
            slo_core::Object::Dict(d) => Value::Number(d.table.len() as f64),
            _ => Value::error("len() expects a string, list or dict"),
        },
        _ => Value::error("len() expects a string, list or dict"),
    }
}

fn native_abs(_heap: &mut Heap, args: &[Value]) -> Value {
    match args[0] {
        Value::Number(n) => Value::Number(n.abs()),
        _ => Value::error("abs() expects a number"),
    }
}

fn native_min(_heap: &mut Heap, args: &[Value]) -> Value {
    fold_numeric(args, f64::min)
}

fn native_max(_heap: &mut Heap, args: &[Value]) -> Value {
    fold_numeric(args, f64::max)
}

fn fold_numeric(args: &[Value], f: impl Fn(f64, f64) -> f64) -> Value {
    let mut nums = args.iter().map(|v| match v {
        Value::Number(n) => Some(*n),
        _ => None,
    });
    let Some(Some(first)) = nums.next() else {
        return Value::error("expects numeric arguments");
    };
    let mut acc = first;
    for n in nums {
        match n {
            Some(n) => acc = f(acc, n),
            None => return Value::error("expects numeric arguments"),
        }
    }
    Value::Number(acc)
}
