use crate::chunk::Chunk;
use crate::gc::GcRef;

/// A compiled function: immutable after compilation (§3). `name` is `None`
/// for the implicit top-level script function, matching clox's `func->name
/// == NULL` check used when rendering stack traces ("in script").
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<GcRef>,
}

impl Function {
    pub fn new(name: Option<GcRef>) -> Self {
        Self { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name }
    }
}
