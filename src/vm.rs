// File: src/vm.rs
//
// Virtual Machine for executing Ember bytecode.
// Stack-based VM: one CallFrame per active closure invocation, a flat
// operand stack shared across frames, and a tight dispatch loop over the
// current frame's chunk. No JIT, no async: allocation is the only implicit
// preemption point (it may run the collector), per the single-threaded
// execution model.

use crate::chunk::OpCode;
use crate::errors::{RuntimeError, TraceFrame};
use crate::heap::{GcRoots, Heap};
use crate::native;
use crate::object::{NativeFn, Obj, UpvalueState};
use crate::table::Table;
use crate::value::{ObjHandle, Value};

const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: ObjHandle,
    ip: usize,
    /// Stack index of this frame's slot 0 (the receiver, or the callee for
    /// plain function calls).
    base: usize,
}

/// Everything the collector must treat as a root while the VM owns the
/// heap: live stack slots, every frame's closure, every still-open
/// upvalue, the globals table, and the cached `init` string. Built fresh
/// at each allocation site from direct field borrows of `Vm` so it never
/// needs to hold `self` itself (which would collide with the simultaneous
/// `&mut self.heap` borrow the allocation call requires).
struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a Table,
    open_upvalues: &'a [ObjHandle],
    init_string: ObjHandle,
}

impl GcRoots for VmRoots<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for v in self.stack {
            heap.mark_value(*v);
        }
        for frame in self.frames {
            heap.mark_handle(frame.closure);
        }
        for h in self.open_upvalues {
            heap.mark_handle(*h);
        }
        for (k, v) in self.globals.iter() {
            heap.mark_handle(k);
            heap.mark_value(v);
        }
        heap.mark_handle(self.init_string);
    }
}

macro_rules! vm_roots {
    ($self:expr) => {
        VmRoots {
            stack: &$self.stack,
            frames: &$self.frames,
            globals: &$self.globals,
            open_upvalues: &$self.open_upvalues,
            init_string: $self.init_string,
        }
    };
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Upvalues still pointing into a live stack slot, unordered; closing
    /// scans the whole list since it is bounded by nesting depth.
    open_upvalues: Vec<ObjHandle>,
    pub heap: Heap,
    init_string: ObjHandle,
    pub trace: bool,
}

impl Vm {
    pub fn new() -> Self {
        struct NoRoots;
        impl GcRoots for NoRoots {
            fn mark_roots(&self, _heap: &mut Heap) {}
        }

        let mut heap = Heap::new();
        let init_string = heap.intern("init", &NoRoots);

        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            trace: false,
        };
        vm.define_native("clock", 0, native::clock);
        vm
    }

    fn define_native(&mut self, name: &str, arity: i32, function: crate::object::NativeFnPtr) {
        let name_handle = self.heap.intern(name, &vm_roots!(self));
        let hash = self.heap.get_string_hash(name_handle);
        let native_handle = self.heap.alloc_native(arity, function, &vm_roots!(self));
        self.globals.set(name_handle, hash, Value::Obj(native_handle));
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop from empty VM stack")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("VM frame stack is never empty while running")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("VM frame stack is never empty while running")
    }

    fn read_byte(&mut self) -> u8 {
        let closure = self.frame().closure;
        let ip = self.frame().ip;
        self.frame_mut().ip += 1;
        let function = self.heap.get_closure(closure).function;
        self.heap.get_function(function).chunk.code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let closure = self.frame().closure;
        let function = self.heap.get_closure(closure).function;
        self.heap.get_function(function).chunk.constants[idx as usize]
    }

    fn read_string_constant(&mut self) -> ObjHandle {
        match self.read_constant() {
            Value::Obj(h) => h,
            _ => unreachable!("name constant must be a string"),
        }
    }

    // --- entry point ------------------------------------------------------

    /// Wraps `function` in a closure with no upvalues and runs it as the
    /// top-level script, matching the calling convention every nested call
    /// goes through.
    pub fn interpret(&mut self, function: ObjHandle) -> Result<(), RuntimeError> {
        let closure = self.heap.alloc_closure(function, Vec::new(), &vm_roots!(self));
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0)?;
        self.run()
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = OpCode::from_u8(byte).expect("corrupt bytecode: unknown opcode");
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.get_string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(v) => self.push(v),
                        None => {
                            let msg = format!("Undefined variable '{}'.", self.heap.get_string(name));
                            return Err(self.runtime_error(msg));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.get_string_hash(name);
                    let value = self.pop();
                    self.globals.set(name, hash, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.get_string_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        let msg = format!("Undefined variable '{}'.", self.heap.get_string(name));
                        return Err(self.runtime_error(msg));
                    }
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let handle = self.heap.get_closure(closure).upvalues[idx];
                    self.push(self.upvalue_value(handle));
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let handle = self.heap.get_closure(closure).upvalues[idx];
                    let value = self.peek(0);
                    self.set_upvalue_value(handle, value);
                }
                OpCode::GetProperty => self.op_get_property()?,
                OpCode::SetProperty => self.op_set_property()?,
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = self.pop_class_handle()?;
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.equals(&b)));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.op_add()?,
                OpCode::Subtract => self.binary_numeric(|a, b| a - b)?,
                OpCode::Multiply => self.binary_numeric(|a, b| a * b)?,
                OpCode::Divide => self.binary_numeric(|a, b| a / b)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    println!("{}", v.format(&self.heap));
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let argc = self.read_byte();
                    self.op_invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let argc = self.read_byte();
                    let superclass = self.pop_class_handle()?;
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => self.op_closure()?,
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("RETURN with no active frame");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string_constant();
                    let handle = self.heap.alloc_class(name, &vm_roots!(self));
                    self.push(Value::Obj(handle));
                }
                OpCode::Inherit => self.op_inherit()?,
                OpCode::Method => self.op_method(),
            }
        }
    }

    // --- property / method opcodes ----------------------------------------

    fn op_get_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string_constant();
        let instance_handle = self.instance_handle_at(0, "Only instances have properties.")?;
        let hash = self.heap.get_string_hash(name);
        if let Some(value) = self.heap.get_instance(instance_handle).fields.get(name, hash) {
            self.pop();
            self.push(value);
            return Ok(());
        }
        let class_handle = self.heap.get_instance(instance_handle).class;
        self.bind_method(class_handle, name)
    }

    fn op_set_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string_constant();
        let instance_handle = self.instance_handle_at(1, "Only instances have fields.")?;
        let value = self.peek(0);
        let hash = self.heap.get_string_hash(name);
        self.heap.get_instance_mut(instance_handle).fields.set(name, hash, value);
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn instance_handle_at(&mut self, distance: usize, error: &str) -> Result<ObjHandle, RuntimeError> {
        match self.peek(distance) {
            Value::Obj(h) if matches!(self.heap.get(h), Obj::Instance(_)) => Ok(h),
            _ => Err(self.runtime_error(error)),
        }
    }

    fn pop_class_handle(&mut self) -> Result<ObjHandle, RuntimeError> {
        match self.pop() {
            Value::Obj(h) if matches!(self.heap.get(h), Obj::Class(_)) => Ok(h),
            _ => Err(self.runtime_error("Superclass must be a class.")),
        }
    }

    fn bind_method(&mut self, class_handle: ObjHandle, name: ObjHandle) -> Result<(), RuntimeError> {
        let hash = self.heap.get_string_hash(name);
        match self.heap.get_class(class_handle).methods.get(name, hash) {
            Some(Value::Obj(closure_handle)) => {
                let receiver = self.pop();
                let bound = self.heap.alloc_bound_method(receiver, closure_handle, &vm_roots!(self));
                self.push(Value::Obj(bound));
                Ok(())
            }
            _ => {
                let msg = format!("Undefined property '{}'.", self.heap.get_string(name));
                Err(self.runtime_error(msg))
            }
        }
    }

    fn op_invoke(&mut self, name: ObjHandle, arg_count: u8) -> Result<(), RuntimeError> {
        let receiver_slot = self.stack.len() - arg_count as usize - 1;
        let instance_handle = match self.stack[receiver_slot] {
            Value::Obj(h) if matches!(self.heap.get(h), Obj::Instance(_)) => h,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        let hash = self.heap.get_string_hash(name);
        if let Some(field) = self.heap.get_instance(instance_handle).fields.get(name, hash) {
            self.stack[receiver_slot] = field;
            return self.call_value(field, arg_count);
        }
        let class_handle = self.heap.get_instance(instance_handle).class;
        self.invoke_from_class(class_handle, name, arg_count)
    }

    fn invoke_from_class(&mut self, class_handle: ObjHandle, name: ObjHandle, arg_count: u8) -> Result<(), RuntimeError> {
        let hash = self.heap.get_string_hash(name);
        match self.heap.get_class(class_handle).methods.get(name, hash) {
            Some(Value::Obj(closure_handle)) => self.call_closure(closure_handle, arg_count),
            _ => {
                let msg = format!("Undefined property '{}'.", self.heap.get_string(name));
                Err(self.runtime_error(msg))
            }
        }
    }

    fn op_inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass_handle = match self.peek(1) {
            Value::Obj(h) if matches!(self.heap.get(h), Obj::Class(_)) => h,
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let subclass_handle = match self.peek(0) {
            Value::Obj(h) => h,
            _ => unreachable!("INHERIT always has a class as its subclass operand"),
        };
        let super_methods = self.heap.get_class(superclass_handle).methods.clone();
        self.heap.get_class_mut(subclass_handle).methods.add_all(&super_methods);
        self.pop();
        Ok(())
    }

    fn op_method(&mut self) {
        let name = self.read_string_constant();
        let method = self.peek(0);
        let class_handle = match self.peek(1) {
            Value::Obj(h) => h,
            _ => unreachable!("METHOD always has a class beneath its closure operand"),
        };
        let hash = self.heap.get_string_hash(name);
        self.heap.get_class_mut(class_handle).methods.set(name, hash, method);
        self.pop();
    }

    // --- calling convention -------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        enum Kind {
            Closure,
            Native(NativeFn),
            Class,
            Bound(Value, ObjHandle),
        }

        let handle = match callee {
            Value::Obj(h) => h,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        let kind = match self.heap.get(handle) {
            Obj::Closure(_) => Kind::Closure,
            Obj::Native(nf) => Kind::Native(*nf),
            Obj::Class(_) => Kind::Class,
            Obj::BoundMethod(bm) => Kind::Bound(bm.receiver, bm.method),
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match kind {
            Kind::Closure => self.call_closure(handle, arg_count),
            Kind::Native(nf) => self.call_native(nf, arg_count),
            Kind::Class => self.call_class(handle, arg_count),
            Kind::Bound(receiver, method) => {
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
        }
    }

    fn call_closure(&mut self, closure_handle: ObjHandle, arg_count: u8) -> Result<(), RuntimeError> {
        let function = self.heap.get_closure(closure_handle).function;
        let arity = self.heap.get_function(function).arity;
        if arg_count != arity {
            let msg = format!("Expected {arity} arguments but got {arg_count}.");
            return Err(self.runtime_error(msg));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, base });
        Ok(())
    }

    fn call_native(&mut self, native: NativeFn, arg_count: u8) -> Result<(), RuntimeError> {
        if native.arity >= 0 && native.arity as u8 != arg_count {
            let msg = format!("Expected {} arguments but got {arg_count}.", native.arity);
            return Err(self.runtime_error(msg));
        }
        let start = self.stack.len() - arg_count as usize;
        let args: Vec<Value> = self.stack[start..].to_vec();
        match (native.function)(&args) {
            Ok(result) => {
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn call_class(&mut self, class_handle: ObjHandle, arg_count: u8) -> Result<(), RuntimeError> {
        let instance_handle = self.heap.alloc_instance(class_handle, &vm_roots!(self));
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance_handle);

        let hash = self.heap.get_string_hash(self.init_string);
        match self.heap.get_class(class_handle).methods.get(self.init_string, hash) {
            Some(Value::Obj(init_handle)) => self.call_closure(init_handle, arg_count),
            Some(_) => unreachable!("method table entries are always closures"),
            None if arg_count == 0 => Ok(()),
            None => {
                let msg = format!("Expected 0 arguments but got {arg_count}.");
                Err(self.runtime_error(msg))
            }
        }
    }

    fn op_closure(&mut self) -> Result<(), RuntimeError> {
        let function_handle = match self.read_constant() {
            Value::Obj(h) => h,
            _ => unreachable!("CLOSURE operand is always a function constant"),
        };
        let upvalue_count = self.heap.get_function(function_handle).upvalue_count;
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let base = self.frame().base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let closure = self.frame().closure;
                upvalues.push(self.heap.get_closure(closure).upvalues[index]);
            }
        }
        let handle = self.heap.alloc_closure(function_handle, upvalues, &vm_roots!(self));
        self.push(Value::Obj(handle));
        Ok(())
    }

    // --- upvalues -----------------------------------------------------------

    fn capture_upvalue(&mut self, location: usize) -> ObjHandle {
        for &handle in &self.open_upvalues {
            if let UpvalueState::Open(slot) = self.heap.get_upvalue(handle).state {
                if slot == location {
                    return handle;
                }
            }
        }
        let handle = self.heap.alloc_upvalue(location, &vm_roots!(self));
        self.open_upvalues.push(handle);
        handle
    }

    fn upvalue_value(&self, handle: ObjHandle) -> Value {
        match self.heap.get_upvalue(handle).state {
            UpvalueState::Open(slot) => self.stack[slot],
            UpvalueState::Closed(v) => v,
        }
    }

    fn set_upvalue_value(&mut self, handle: ObjHandle, value: Value) {
        match self.heap.get_upvalue(handle).state {
            UpvalueState::Open(slot) => self.stack[slot] = value,
            UpvalueState::Closed(_) => self.heap.get_upvalue_mut(handle).state = UpvalueState::Closed(value),
        }
    }

    /// Closes every still-open upvalue whose captured slot is at or above
    /// `from_slot`, idempotently (an already-closed upvalue is never in
    /// `open_upvalues`, so a repeat call over the same range is a no-op).
    fn close_upvalues(&mut self, from_slot: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let handle = self.open_upvalues[i];
            let slot = match self.heap.get_upvalue(handle).state {
                UpvalueState::Open(s) => s,
                UpvalueState::Closed(_) => unreachable!("open_upvalues only ever holds open upvalues"),
            };
            if slot >= from_slot {
                let value = self.stack[slot];
                self.heap.get_upvalue_mut(handle).state = UpvalueState::Closed(value);
                self.open_upvalues.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    // --- arithmetic helpers --------------------------------------------------

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
            }
            (Value::Obj(ha), Value::Obj(hb))
                if matches!(self.heap.get(ha), Obj::String(_)) && matches!(self.heap.get(hb), Obj::String(_)) =>
            {
                let mut concatenated = self.heap.get_string(ha).to_string();
                concatenated.push_str(self.heap.get_string(hb));
                self.pop();
                self.pop();
                let handle = self.heap.intern(&concatenated, &vm_roots!(self));
                self.push(Value::Obj(handle));
            }
            _ => return Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
        Ok(())
    }

    // --- errors and diagnostics ---------------------------------------------

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = self.heap.get_closure(frame.closure).function;
            let f = self.heap.get_function(function);
            let line = f.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
            let name = match f.name {
                Some(n) => self.heap.get_string(n).to_string(),
                None => "script".to_string(),
            };
            trace.push(TraceFrame { line, name });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError::new(message, trace)
    }

    fn trace_instruction(&self) {
        let closure = self.frame().closure;
        let function = self.heap.get_closure(closure).function;
        let chunk = &self.heap.get_function(function).chunk;
        let ip = self.frame().ip;
        let opcode = OpCode::from_u8(chunk.code[ip]);
        eprint!("          [");
        for v in &self.stack {
            eprint!(" {} ", v.format(&self.heap));
        }
        eprintln!(" ]");
        eprintln!("{ip:04} {opcode:?}");
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}
