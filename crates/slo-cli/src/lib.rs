//! slo-cli — argument parsing, the REPL, and file-mode execution (§6).
//!
//! `main.rs` stays minimal (error-reporting setup, then delegate here) so
//! the actual CLI logic is unit-testable with `cargo test -p slo-cli`.

use std::collections::HashSet;
use std::io::Write;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use slo_core::{Heap, ObjRef, Object, Value};
use slo_vm::{VmError, Vm};

/// slo — a bytecode-compiled, class-based scripting language interpreter.
#[derive(Parser, Debug)]
#[command(name = "slo", version, about)]
struct Cli {
    /// Path to a .slo source file. Omitted to start the REPL.
    path: Option<Utf8PathBuf>,

    /// Run the garbage collector before every allocation (debug builds).
    #[arg(long, env = "SLO_GC_STRESS")]
    gc_stress: bool,

    /// Log every garbage collection cycle to stderr.
    #[arg(long, env = "SLO_GC_LOG")]
    gc_log: bool,

    /// Compile `path` and print its bytecode instead of running it.
    #[arg(long, requires = "path")]
    disassemble: bool,
}

pub fn run() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(64),
            };
        }
    };

    if cli.disassemble {
        // `requires = "path"` on the clap arg guarantees this is Some.
        return disassemble_file(cli.path.as_ref().expect("--disassemble requires a path"));
    }

    let mut vm = Vm::new();
    vm.set_gc_stress(cli.gc_stress);
    vm.set_gc_log(cli.gc_log);

    match cli.path {
        Some(path) => run_file(&mut vm, &path),
        None => run_repl(&mut vm),
    }
}

/// Compiles `path` without running it and prints every function's bytecode
/// listing, innermost nested functions included. Debug tooling only — slo
/// has no persisted bytecode format to write these listings back into
/// (spec.md's non-goals rule that out), so this always reads source.
fn disassemble_file(path: &camino::Utf8Path) -> ExitCode {
    let mut heap = Heap::new();
    match slo_compiler::compile_file(path.as_std_path(), &mut heap) {
        Ok(func) => {
            print!("{}", disassemble_program(&heap, func));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(65)
        }
    }
}

fn disassemble_program(heap: &Heap, top: ObjRef) -> String {
    let mut out = String::new();
    let mut queue = vec![top];
    let mut seen = HashSet::new();
    while let Some(func_ref) = queue.pop() {
        if !seen.insert(func_ref.index()) {
            continue;
        }
        let Object::Function(f) = heap.get(func_ref) else { continue };
        let label = match f.name {
            Some(n) => heap.get(n).as_string().unwrap_or("?").to_string(),
            None => "<script>".to_string(),
        };
        out.push_str(&f.chunk.disassemble(&label, heap));
        for constant in &f.chunk.constants {
            if let Value::Obj(r) = constant {
                if matches!(heap.get(*r), Object::Function(_)) {
                    queue.push(*r);
                }
            }
        }
    }
    out
}

/// Runs a single source file through `vm` and maps the outcome to the exit
/// codes spec.md §6 defines. Public so integration tests can drive the
/// file-mode path directly instead of spawning the `slo` binary.
pub fn run_file(vm: &mut Vm, path: &camino::Utf8Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("slo: could not read '{path}': {e}");
            return ExitCode::from(74);
        }
    };
    match vm.interpret(&source, path.as_str()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(VmError::Compile(e)) => {
            eprintln!("{e}");
            ExitCode::from(65)
        }
        Err(VmError::Runtime(e)) => {
            eprintln!("{e}");
            ExitCode::from(70)
        }
    }
}

fn run_repl(vm: &mut Vm) -> ExitCode {
    let mut line_no = 0u32;
    loop {
        print!("slo> ");
        if std::io::stdout().flush().is_err() {
            break;
        }
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => break, // EOF (Ctrl-D)
            Ok(_) => {}
            Err(_) => break,
        }
        if line.trim().is_empty() {
            continue;
        }
        line_no += 1;
        let source_file = format!("<repl:{line_no}>");
        match vm.interpret(&line, &source_file) {
            Ok(value) => {
                if !matches!(value, Value::Nil) {
                    println!("{}", slo_vm::format::display_value(vm.heap(), &value));
                }
            }
            Err(e) => eprintln!("{e}"),
        }
    }
    ExitCode::SUCCESS
}
