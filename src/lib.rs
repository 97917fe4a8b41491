// File: src/lib.rs
//
// Library interface for the Ember interpreter: scanner, compiler, heap and
// VM modules, plus the `interpret` entry point shared by the REPL and the
// CLI file-runner.

pub mod chunk;
pub mod compiler;
pub mod errors;
pub mod heap;
pub mod lexer;
pub mod native;
pub mod object;
pub mod repl;
pub mod table;
pub mod value;
pub mod vm;

use vm::Vm;

pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Compiles and runs `source` against `vm`, printing compile errors and the
/// runtime stack trace (if any) to stderr the way the CLI and REPL both
/// expect. `vm` is reused across calls so globals, the intern table and the
/// heap persist — this is what lets the REPL treat every line as a fresh
/// top-level script sharing one session's state.
pub fn interpret(source: &str, vm: &mut Vm) -> InterpretResult {
    let result = compiler::compile(source, &mut vm.heap);
    if !result.errors.is_empty() {
        for err in &result.errors {
            err.print();
        }
        return InterpretResult::CompileError;
    }
    let function = match result.function {
        Some(f) => f,
        None => return InterpretResult::CompileError,
    };
    match vm.interpret(function) {
        Ok(()) => InterpretResult::Ok,
        Err(err) => {
            err.print();
            InterpretResult::RuntimeError
        }
    }
}
