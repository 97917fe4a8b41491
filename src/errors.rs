// File: src/errors.rs
//
// Error reporting for Ember: compile-time diagnostics in the
// `[line L] Error at '<lexeme>': <message>` form and runtime errors with a
// stack trace, both colored the way the teacher colors its diagnostics.

use colored::Colorize;
use std::fmt;

/// One compile-time diagnostic, already formatted with its source line and
/// lexeme (or "end") by the compiler that raised it.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub at: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.line, self.at, self.message)
    }
}

impl CompileError {
    pub fn print(&self) {
        eprintln!("{}", self.to_string().red());
    }
}

/// One frame of a runtime stack trace, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    /// The function name, or "script" for the top-level frame.
    pub name: String,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] in {}", self.line, self.name)
    }
}

/// A runtime error: a message plus the call stack at the point of failure,
/// innermost frame first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        RuntimeError { message: message.into(), trace }
    }

    pub fn print(&self) {
        eprintln!("{}", self.message.red().bold());
        for frame in &self.trace {
            eprintln!("{}", frame.to_string().bright_blue());
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
