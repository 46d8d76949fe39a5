//! format.rs — heap-aware value stringification, used by `print`/`println`,
//! string concatenation, and `INTERPOLATE`.

use slo_core::{Heap, Object, Value};

pub fn display_value(heap: &Heap, value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(_) => value.to_string(),
        Value::Error(e) => format!("error: {e}"),
        Value::Obj(r) => match heap.get(*r) {
            Object::String { bytes, .. } => bytes.clone(),
            Object::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", display_value(heap, &Value::Obj(n))),
                None => "<script>".to_string(),
            },
            Object::Native(n) => format!("<native fn {}>", n.name),
            Object::Closure(c) => match heap.get(c.function) {
                Object::Function(f) => match f.name {
                    Some(n) => format!("<fn {}>", display_value(heap, &Value::Obj(n))),
                    None => "<script>".to_string(),
                },
                _ => "<closure>".to_string(),
            },
            Object::Upvalue(_) => "<upvalue>".to_string(),
            Object::Class(c) => format!("<class {}>", display_value(heap, &Value::Obj(c.name))),
            Object::Instance(i) => {
                let class_name = match heap.get(i.class) {
                    Object::Class(c) => display_value(heap, &Value::Obj(c.name)),
                    _ => "?".to_string(),
                };
                format!("<{class_name} instance>")
            }
            Object::BoundMethod(b) => display_value(heap, &Value::Obj(b.closure)),
            Object::List(l) => {
                let items: Vec<String> = l.elements.iter().map(|v| repr_value(heap, v)).collect();
                format!("[{}]", items.join(", "))
            }
            Object::Dict(d) => {
                let mut items = Vec::new();
                d.table.for_each(|k, v| {
                    items.push(format!("{}: {}", repr_value(heap, k), repr_value(heap, v)));
                });
                format!("{{{}}}", items.join(", "))
            }
            Object::Enum(e) => format!("<enum {}>", display_value(heap, &Value::Obj(e.name))),
            Object::Module(m) => format!("<module {}>", m.name),
            Object::File(file) => format!("<file {}>", file.name),
        },
    }
}

/// Like `display_value` but quotes strings — used for elements nested
/// inside a list/dict rendering, matching the common "repr vs str" split.
fn repr_value(heap: &Heap, value: &Value) -> String {
    if let Value::Obj(r) = value {
        if let Object::String { bytes, .. } = heap.get(*r) {
            return format!("\"{bytes}\"");
        }
    }
    display_value(heap, value)
}
