// File: src/repl.rs
//
// Interactive prompt for Ember. Wraps rustyline for line editing and
// history, and keeps one `Vm` alive for the whole session so declarations
// and side effects from earlier input remain visible to later input.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::interpret;
use crate::lexer::{Scanner, TokenKind};
use crate::vm::Vm;

const COMMANDS: &[(&str, &str)] = &[
    (":help", "show this message"),
    (":reset", "drop all globals and start a fresh session"),
    (":quit", "leave the prompt"),
];

/// REPL session that keeps one `Vm` alive across every line so that
/// globals, the string-intern table and the heap persist between inputs.
pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new(vm: Vm) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Repl { vm, editor: DefaultEditor::new()? })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        println!(
            "{}",
            format!("ember {} — :help for commands, :quit to leave", env!("CARGO_PKG_VERSION")).cyan()
        );

        let mut pending = String::new();
        loop {
            let prompt = if pending.is_empty() { "> ".green().to_string() } else { "| ".blue().to_string() };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if pending.is_empty() {
                        if let Some(rest) = line.trim().strip_prefix(':') {
                            if !self.run_command(rest) {
                                break;
                            }
                            continue;
                        }
                    }

                    pending.push_str(&line);
                    pending.push('\n');

                    if Self::is_complete(&pending) {
                        let _ = interpret(&pending, &mut self.vm);
                        pending.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    pending.clear();
                    println!("{}", "(interrupted)".yellow());
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{err}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Runs a leading-colon command. Returns false when the session should end.
    fn run_command(&mut self, cmd: &str) -> bool {
        match cmd {
            "help" | "h" => {
                for (name, desc) in COMMANDS {
                    println!("  {:<8} {}", name.yellow(), desc);
                }
                true
            }
            "reset" | "r" => {
                self.vm = Vm::new();
                println!("{}", "session reset".green());
                true
            }
            "quit" | "q" | "exit" => false,
            other => {
                println!("{}", format!("unknown command ':{other}', try :help").red());
                true
            }
        }
    }

    /// Tokenizes `source` with a fresh scanner and tracks paren/brace depth
    /// the same way the compiler groups them, so a line is only handed to
    /// `interpret` once every opened delimiter is closed. Reusing the real
    /// scanner (rather than a hand-rolled character count) means string
    /// literals and line comments are skipped correctly for free.
    fn is_complete(source: &str) -> bool {
        let mut scanner = Scanner::new(source);
        let mut depth: i32 = 0;
        loop {
            let token = scanner.scan_token();
            match token.kind {
                TokenKind::Eof => return depth <= 0,
                TokenKind::Error if token.lexeme == "Unterminated string." => return false,
                TokenKind::LeftParen | TokenKind::LeftBrace => depth += 1,
                TokenKind::RightParen | TokenKind::RightBrace => depth -= 1,
                _ => {}
            }
        }
    }
}
