// File: src/compiler.rs
//
// Single-pass Pratt compiler for Ember: parses tokens and emits bytecode
// directly into a Chunk, with no intermediate AST. Nested compilers for
// functions and classes are an explicit stack rather than hidden recursion
// over the host language's call stack, so the collector can enumerate every
// function still under construction.

use crate::chunk::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::heap::{GcRoots, Heap};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::object::LoxFunction;
use crate::value::{ObjHandle, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

/// Narrow, explicitly-scoped unsafe boundary: the Pratt dispatch table
/// needs `Compiler` to carry a single lifetime parameter (the source
/// borrow) so its handler functions coerce to a plain, non-higher-ranked
/// function-pointer type. `compile()` is the only constructor and holds
/// the real `&mut Heap` borrow for the whole call, so every `HeapPtr`
/// handed out here is valid for as long as any `Compiler` that carries one.
#[derive(Clone, Copy)]
struct HeapPtr(*mut Heap);

impl HeapPtr {
    fn get(self) -> &'static mut Heap {
        unsafe { &mut *self.0 }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, bool);

#[derive(Clone, Copy)]
struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn rule_none<'src>() -> ParseRule<'src> {
    ParseRule { prefix: None, infix: None, precedence: Precedence::None }
}

fn get_rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    use TokenKind::*;
    match kind {
        LeftParen => ParseRule { prefix: Some(Compiler::grouping), infix: Some(Compiler::call), precedence: Precedence::Call },
        Dot => ParseRule { prefix: Option::None, infix: Some(Compiler::dot), precedence: Precedence::Call },
        Minus => ParseRule { prefix: Some(Compiler::unary), infix: Some(Compiler::binary), precedence: Precedence::Term },
        Plus => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Term },
        Slash => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Star => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Bang => ParseRule { prefix: Some(Compiler::unary), infix: Option::None, precedence: Precedence::None },
        BangEqual => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        EqualEqual => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        Greater => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        GreaterEqual => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Less => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        LessEqual => ParseRule { prefix: Option::None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Identifier => ParseRule { prefix: Some(Compiler::variable), infix: Option::None, precedence: Precedence::None },
        String => ParseRule { prefix: Some(Compiler::string), infix: Option::None, precedence: Precedence::None },
        Number => ParseRule { prefix: Some(Compiler::number), infix: Option::None, precedence: Precedence::None },
        TokenKind::And => ParseRule { prefix: Option::None, infix: Some(Compiler::and), precedence: Precedence::And },
        TokenKind::Or => ParseRule { prefix: Option::None, infix: Some(Compiler::or), precedence: Precedence::Or },
        False => ParseRule { prefix: Some(Compiler::literal), infix: Option::None, precedence: Precedence::None },
        True => ParseRule { prefix: Some(Compiler::literal), infix: Option::None, precedence: Precedence::None },
        Nil => ParseRule { prefix: Some(Compiler::literal), infix: Option::None, precedence: Precedence::None },
        This => ParseRule { prefix: Some(Compiler::this), infix: Option::None, precedence: Precedence::None },
        Super => ParseRule { prefix: Some(Compiler::super_), infix: Option::None, precedence: Precedence::None },
        _ => rule_none(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// One nested function's worth of in-progress compilation state.
struct FunctionCtx<'src> {
    function_type: FunctionType,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

impl<'src> FunctionCtx<'src> {
    fn new(function_type: FunctionType, name: Option<String>) -> Self {
        // Slot 0 is reserved: the receiver for methods/initializers, an
        // unnameable placeholder for everything else (so `this` cannot
        // accidentally resolve to it outside a method).
        let slot0_name = if function_type == FunctionType::Method || function_type == FunctionType::Initializer {
            "this"
        } else {
            ""
        };
        FunctionCtx {
            function_type,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot0_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    stack: Vec<FunctionCtx<'src>>,
    classes: Vec<ClassCtx>,
    heap: HeapPtr,
    errors: Vec<CompileError>,
}

impl GcRoots for Compiler<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for ctx in &self.stack {
            for v in &ctx.chunk.constants {
                heap.mark_value(*v);
            }
        }
    }
}

impl<'src> Compiler<'src> {
    fn current(&mut self) -> &mut FunctionCtx<'src> {
        self.stack.last_mut().expect("compiler stack is never empty")
    }

    fn current_ref(&self) -> &FunctionCtx<'src> {
        self.stack.last().expect("compiler stack is never empty")
    }

    // --- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    // --- error reporting ----------------------------------------------

    fn error_at_current(&mut self, message: &str) {
        let tok = self.current;
        self.error_at(tok, message);
    }

    fn error(&mut self, message: &str) {
        let tok = self.previous;
        self.error_at(tok, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let at = if token.kind == TokenKind::Eof {
            " at end".to_string()
        } else if token.kind == TokenKind::Error {
            String::new()
        } else {
            format!(" at '{}'", token.lexeme)
        };
        self.errors.push(CompileError { line: token.line, at, message: message.to_string() });
        self.had_error = true;
    }

    // --- emission -------------------------------------------------------

    fn emit(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit(op as u8);
    }

    fn emit_two(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit(byte);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit(0xff);
        self.emit(0xff);
        self.current_ref().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(e) = self.current().chunk.patch_jump(offset) {
            self.error(&e);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_ref().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let line = self.previous.line;
        self.current().chunk.write_u16(offset as u16, line);
    }

    fn emit_return(&mut self) {
        if self.current_ref().function_type == FunctionType::Initializer {
            self.emit_two(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current().chunk.add_constant(value) {
            Ok(idx) => idx,
            Err(e) => {
                self.error(&e);
                0
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.get().intern(name, &*self);
        self.make_constant(Value::Obj(handle))
    }

    // --- scopes and locals ----------------------------------------------

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current().scope_depth -= 1;
        let depth = self.current_ref().scope_depth;
        while let Some(local) = self.current_ref().locals.last() {
            if (local.depth as i64) <= depth as i64 {
                break;
            }
            if self.current_ref().locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_ref().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.current_ref().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.current_ref().scope_depth as i64;
        for local in self.current_ref().locals.iter().rev() {
            if local.depth != -1 && (local.depth as i64) < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        if self.current_ref().scope_depth == 0 {
            return;
        }
        let depth = self.current_ref().scope_depth as i32;
        if let Some(local) = self.current().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_ref().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_ref().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_two(OpCode::DefineGlobal, global);
    }

    fn resolve_local(ctx: &FunctionCtx<'src>, name: &str) -> Result<Option<u8>, &'static str> {
        for (i, local) in ctx.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    fn add_upvalue(ctx: &mut FunctionCtx<'src>, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (i, up) in ctx.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if ctx.upvalues.len() >= 256 {
            return Err("Too many closure variables in function.");
        }
        ctx.upvalues.push(UpvalueRef { index, is_local });
        Ok((ctx.upvalues.len() - 1) as u8)
    }

    /// Resolves `name` as an upvalue by walking the compiler stack from
    /// `depth` (the function currently being compiled) outward.
    fn resolve_upvalue(&mut self, depth: usize, name: &str) -> Result<Option<u8>, &'static str> {
        if depth == 0 {
            return Ok(None);
        }
        let enclosing = depth - 1;
        match Self::resolve_local(&self.stack[enclosing], name) {
            Ok(Some(local_idx)) => {
                self.stack[enclosing].locals[local_idx as usize].is_captured = true;
                return Ok(Some(Self::add_upvalue(&mut self.stack[depth], local_idx, true)?));
            }
            Err(e) => return Err(e),
            Ok(None) => {}
        }
        match self.resolve_upvalue(enclosing, name)? {
            Some(up_idx) => Ok(Some(Self::add_upvalue(&mut self.stack[depth], up_idx, false)?)),
            None => Ok(None),
        }
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let depth = self.stack.len() - 1;
        let (get_op, set_op, arg) = match Self::resolve_local(&self.stack[depth], name) {
            Ok(Some(idx)) => (OpCode::GetLocal, OpCode::SetLocal, idx),
            Ok(None) => match self.resolve_upvalue(depth, name) {
                Ok(Some(idx)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, idx),
                Ok(None) => {
                    let arg = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, arg)
                }
                Err(e) => {
                    self.error(e);
                    (OpCode::GetLocal, OpCode::SetLocal, 0)
                }
            },
            Err(e) => {
                self.error(e);
                (OpCode::GetLocal, OpCode::SetLocal, 0)
            }
        };
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_two(set_op, arg);
        } else {
            self.emit_two(get_op, arg);
        }
    }

    // --- Pratt engine ------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match get_rule(self.previous.kind).prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // --- prefix / infix handlers (Pratt table targets) -------------------

    fn number(c: &mut Compiler<'src>, _can_assign: bool) {
        let value: f64 = c.previous.lexeme.parse().unwrap_or(0.0);
        let idx = c.make_constant(Value::Number(value));
        c.emit_two(OpCode::Constant, idx);
    }

    fn string(c: &mut Compiler<'src>, _can_assign: bool) {
        let raw = c.previous.lexeme;
        let text = &raw[1..raw.len() - 1];
        let handle = c.heap.get().intern(text, &*c);
        let idx = c.make_constant(Value::Obj(handle));
        c.emit_two(OpCode::Constant, idx);
    }

    fn literal(c: &mut Compiler<'src>, _can_assign: bool) {
        match c.previous.kind {
            TokenKind::False => c.emit_op(OpCode::False),
            TokenKind::True => c.emit_op(OpCode::True),
            TokenKind::Nil => c.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn grouping(c: &mut Compiler<'src>, _can_assign: bool) {
        c.expression();
        c.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(c: &mut Compiler<'src>, _can_assign: bool) {
        let op_kind = c.previous.kind;
        c.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => c.emit_op(OpCode::Negate),
            TokenKind::Bang => c.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(c: &mut Compiler<'src>, _can_assign: bool) {
        let op_kind = c.previous.kind;
        let rule = get_rule(op_kind);
        c.parse_precedence(rule.precedence.next());
        match op_kind {
            TokenKind::Plus => c.emit_op(OpCode::Add),
            TokenKind::Minus => c.emit_op(OpCode::Subtract),
            TokenKind::Star => c.emit_op(OpCode::Multiply),
            TokenKind::Slash => c.emit_op(OpCode::Divide),
            TokenKind::BangEqual => {
                c.emit_op(OpCode::Equal);
                c.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => c.emit_op(OpCode::Equal),
            TokenKind::Greater => c.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                c.emit_op(OpCode::Less);
                c.emit_op(OpCode::Not);
            }
            TokenKind::Less => c.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                c.emit_op(OpCode::Greater);
                c.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and(c: &mut Compiler<'src>, _can_assign: bool) {
        let end_jump = c.emit_jump(OpCode::JumpIfFalse);
        c.emit_op(OpCode::Pop);
        c.parse_precedence(Precedence::And);
        c.patch_jump(end_jump);
    }

    fn or(c: &mut Compiler<'src>, _can_assign: bool) {
        let else_jump = c.emit_jump(OpCode::JumpIfFalse);
        let end_jump = c.emit_jump(OpCode::Jump);
        c.patch_jump(else_jump);
        c.emit_op(OpCode::Pop);
        c.parse_precedence(Precedence::Or);
        c.patch_jump(end_jump);
    }

    fn call(c: &mut Compiler<'src>, _can_assign: bool) {
        let argc = c.argument_list();
        c.emit_two(OpCode::Call, argc);
    }

    fn dot(c: &mut Compiler<'src>, can_assign: bool) {
        c.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = c.previous.lexeme;
        let idx = c.identifier_constant(name);
        if can_assign && c.matches(TokenKind::Equal) {
            c.expression();
            c.emit_two(OpCode::SetProperty, idx);
        } else if c.matches(TokenKind::LeftParen) {
            let argc = c.argument_list();
            c.emit_two(OpCode::Invoke, idx);
            c.emit(argc);
        } else {
            c.emit_two(OpCode::GetProperty, idx);
        }
    }

    fn variable(c: &mut Compiler<'src>, can_assign: bool) {
        let name = c.previous.lexeme;
        c.named_variable(name, can_assign);
    }

    fn this(c: &mut Compiler<'src>, _can_assign: bool) {
        if c.classes.is_empty() {
            c.error("Can't use 'this' outside of a class.");
            return;
        }
        c.named_variable("this", false);
    }

    fn super_(c: &mut Compiler<'src>, _can_assign: bool) {
        if c.classes.is_empty() {
            c.error("Can't use 'super' outside of a class.");
        } else if !c.classes.last().unwrap().has_superclass {
            c.error("Can't use 'super' in a class with no superclass.");
        }
        c.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        c.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = c.previous.lexeme;
        let idx = c.identifier_constant(name);
        c.named_variable("this", false);
        if c.matches(TokenKind::LeftParen) {
            let argc = c.argument_list();
            c.named_variable("super", false);
            c.emit_two(OpCode::SuperInvoke, idx);
            c.emit(argc);
        } else {
            c.named_variable("super", false);
            c.emit_two(OpCode::GetSuper, idx);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    // --- statements -------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_two(OpCode::Class, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassCtx { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme;
            Self::variable(self, false);
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let class = self.classes.pop().unwrap();
        if class.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);
        let function_type = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(function_type);
        self.emit_two(OpCode::Method, name_const);
    }

    fn function(&mut self, function_type: FunctionType) {
        let name = self.previous.lexeme.to_string();
        self.stack.push(FunctionCtx::new(function_type, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current().arity += 1;
                if self.current_ref().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        self.emit_return();

        // Intern the name and allocate the function object while its
        // `FunctionCtx` is still on `self.stack` — `mark_roots` only walks
        // that stack, so doing this after popping would leave the chunk's
        // constants unrooted across whichever of these two calls triggers
        // a collection.
        let arity = self.current_ref().arity;
        let upvalue_count = self.current_ref().upvalues.len() as u8;
        let chunk = self.current_ref().chunk.clone();
        let name_handle = self.heap.get().intern(self.current_ref().name.as_deref().unwrap_or(""), &*self);

        let mut lox_fn = LoxFunction::new();
        lox_fn.arity = arity;
        lox_fn.upvalue_count = upvalue_count;
        lox_fn.chunk = chunk;
        lox_fn.name = Some(name_handle);

        let fn_handle = self.heap.get().alloc_function(lox_fn, &*self);

        let ctx = self.stack.pop().unwrap();
        let upvalues = ctx.upvalues;
        let idx = self.make_constant(Value::Obj(fn_handle));
        self.emit_two(OpCode::Closure, idx);
        for up in upvalues {
            self.emit(if up.is_local { 1 } else { 0 });
            self.emit(up.index);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn return_statement(&mut self) {
        if self.stack.len() == 1 {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_ref().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_ref().chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_ref().chunk.code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_ref().chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }
}

pub struct CompileResult {
    pub function: Option<ObjHandle>,
    pub errors: Vec<CompileError>,
}

/// Compiles `source` into a top-level script function. Returns `None` for
/// `function` if any compile error occurred; the compiler still runs to
/// completion (accumulating further errors via panic-mode recovery) but
/// the top-level function is discarded.
pub fn compile(source: &str, heap: &mut Heap) -> CompileResult {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: Token { kind: TokenKind::Error, lexeme: "", line: 0 },
        current: Token { kind: TokenKind::Error, lexeme: "", line: 0 },
        had_error: false,
        panic_mode: false,
        stack: vec![FunctionCtx::new(FunctionType::Script, None)],
        classes: Vec::new(),
        heap: HeapPtr(heap as *mut Heap),
        errors: Vec::new(),
    };

    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.emit_return();

    // Build the script function while its `FunctionCtx` is still on
    // `compiler.stack`, so `compiler`'s own `mark_roots` covers its chunk's
    // constants if `alloc_function` triggers a collection.
    let mut script = LoxFunction::new();
    script.arity = 0;
    script.upvalue_count = 0;
    script.chunk = compiler.current_ref().chunk.clone();
    script.name = None;

    let handle = heap.alloc_function(script, &compiler);

    compiler.stack.pop();
    let had_error = compiler.had_error;
    let errors = compiler.errors;

    CompileResult { function: if had_error { None } else { Some(handle) }, errors }
}
