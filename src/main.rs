// File: src/main.rs
//
// Main entry point for the Ember interpreter. With no file argument it
// opens an interactive prompt; given a path it compiles and runs the file
// once and exits with a status code reflecting whether it compiled and ran
// cleanly.

use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use ember::repl::Repl;
use ember::vm::Vm;
use ember::InterpretResult;

const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

#[derive(ClapParser)]
#[command(
    name = "ember",
    about = "Ember: a small class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to an .ember script. Omit to start the interactive prompt.
    file: Option<PathBuf>,

    /// Print every instruction the VM executes, with the stack before it.
    #[arg(long)]
    trace: bool,

    /// Force a garbage collection before every allocation.
    #[arg(long)]
    stress_gc: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut vm = Vm::new();
    vm.trace = cli.trace;
    vm.heap.stress_gc = cli.stress_gc;

    match cli.file {
        Some(path) => run_file(&path, &mut vm),
        None => {
            if let Err(e) = Repl::new(vm).and_then(|mut r| r.run()) {
                eprintln!("REPL error: {e}");
                return ExitCode::from(1);
            }
            ExitCode::SUCCESS
        }
    }
}

fn run_file(path: &PathBuf, vm: &mut Vm) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read file '{}': {e}", path.display());
            return ExitCode::from(74);
        }
    };

    match ember::interpret(&source, vm) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(EXIT_COMPILE_ERROR),
        InterpretResult::RuntimeError => ExitCode::from(EXIT_RUNTIME_ERROR),
    }
}
