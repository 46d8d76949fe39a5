//! tests/integration.rs — end-to-end checks of the file-mode execution path
//! (§6): a `.slo` source file on disk goes in, an exit code matching the
//! spec's 0/65/70/74 contract comes out.
//!
//! Run locally with:
//!   cargo test -p slo-cli

use std::fs;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use slo_vm::Vm;

fn write_source(dir: &tempfile::TempDir, name: &str, source: &str) -> Utf8PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, source).expect("write temp source file");
    Utf8PathBuf::from_path_buf(path).expect("temp path is valid utf-8")
}

#[test]
fn a_well_formed_program_exits_successfully() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_source(&dir, "ok.slo", "var x = 1 + 2; assert(x == 3);");

    let mut vm = Vm::new();
    assert_eq!(slo_cli::run_file(&mut vm, &path), ExitCode::SUCCESS);
}

#[test]
fn a_syntax_error_exits_with_code_65() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_source(&dir, "bad_syntax.slo", "var x = ;");

    let mut vm = Vm::new();
    assert_eq!(slo_cli::run_file(&mut vm, &path), ExitCode::from(65));
}

#[test]
fn a_failing_assertion_exits_with_code_70() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_source(&dir, "bad_runtime.slo", "assert(1 == 2);");

    let mut vm = Vm::new();
    assert_eq!(slo_cli::run_file(&mut vm, &path), ExitCode::from(70));
}

#[test]
fn division_by_zero_exits_with_code_70() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_source(&dir, "div_zero.slo", "var x = 1 / 0;");

    let mut vm = Vm::new();
    assert_eq!(slo_cli::run_file(&mut vm, &path), ExitCode::from(70));
}

#[test]
fn a_missing_file_exits_with_code_74() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("does_not_exist.slo");
    let path = Utf8PathBuf::from_path_buf(path).expect("temp path is valid utf-8");

    let mut vm = Vm::new();
    assert_eq!(slo_cli::run_file(&mut vm, &path), ExitCode::from(74));
}

#[test]
fn classes_closures_and_imports_all_run_to_completion_in_one_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_source(
        &dir,
        "program.slo",
        "class Counter { \
             init() { self.n = 0; } \
             bump() { self.n = self.n + 1; return self.n; } \
         } \
         var c = Counter(); \
         c.bump(); \
         c.bump(); \
         assert(c.bump() == 3);",
    );

    let mut vm = Vm::new();
    assert_eq!(slo_cli::run_file(&mut vm, &path), ExitCode::SUCCESS);
}
