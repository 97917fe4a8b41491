// File: src/object.rs
//
// Heap object model for the Ember VM: strings, functions, native functions,
// closures, upvalues, classes, instances and bound methods. Every kind is
// a plain struct kept in the Heap's arena behind an ObjHandle; there is no
// intrusive pointer list here because the arena slot itself is the sole
// enumeration path the collector needs (see heap.rs).

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::{ObjHandle, Value};

#[derive(Debug)]
pub struct LoxString {
    pub hash: u32,
    pub chars: Box<str>,
}

#[derive(Debug)]
pub struct LoxFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<ObjHandle>,
}

impl LoxFunction {
    pub fn new() -> Self {
        LoxFunction { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name: None }
    }
}

pub type NativeFnPtr = fn(&[Value]) -> Result<Value, String>;

#[derive(Debug, Clone, Copy)]
pub struct NativeFn {
    /// -1 means variadic; otherwise the exact expected argument count.
    pub arity: i32,
    pub function: NativeFnPtr,
}

#[derive(Debug)]
pub struct Closure {
    pub function: ObjHandle,
    pub upvalues: Vec<ObjHandle>,
}

#[derive(Debug)]
pub enum UpvalueState {
    /// Points at a slot on the live VM stack.
    Open(usize),
    /// Owns its own cell after the enclosing frame has returned.
    Closed(Value),
}

#[derive(Debug)]
pub struct Upvalue {
    pub state: UpvalueState,
}

#[derive(Debug)]
pub struct Class {
    pub name: ObjHandle,
    pub methods: Table,
}

impl Class {
    pub fn new(name: ObjHandle) -> Self {
        Class { name, methods: Table::new() }
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: ObjHandle,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: ObjHandle) -> Self {
        Instance { class, fields: Table::new() }
    }
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    /// Always an ObjHandle pointing at a Closure.
    pub method: ObjHandle,
}

#[derive(Debug)]
pub enum Obj {
    String(LoxString),
    Function(LoxFunction),
    Native(NativeFn),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// FNV-1a, matching the spec's precomputed string hash.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
