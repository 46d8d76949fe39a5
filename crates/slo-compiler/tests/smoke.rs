//! tests/smoke.rs — compiles a realistic multi-construct program through
//! the crate's public API, the same way `slo-vm` and `slo-cli` do, rather
//! than going through `Compiler` directly.

use std::fs;

use slo_core::{Heap, Object};

#[test]
fn compile_file_reads_and_compiles_a_real_source_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("program.slo");
    fs::write(
        &path,
        "class Shape { \
             area() { return 0; } \
         } \
         class Square extends Shape { \
             init(side) { self.side = side; } \
             area() { return self.side * self.side; } \
         } \
         var s = Square(4); \
         var a = s.area();",
    )
    .expect("write temp source file");

    let mut heap = Heap::new();
    let func = slo_compiler::compile_file(&path, &mut heap).expect("should compile");
    match heap.get(func) {
        Object::Function(f) => assert_eq!(f.arity, 0),
        other => panic!("expected a Function object, got {other:?}"),
    }
}

#[test]
fn compile_str_reports_a_diagnostic_for_unterminated_strings() {
    let mut heap = Heap::new();
    let err = slo_compiler::compile_str(r#"var s = "unterminated;"#, "<smoke>", &mut heap)
        .expect_err("should fail to compile");
    assert!(!err.to_string().is_empty());
}
