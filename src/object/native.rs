use std::rc::Rc;

use crate::error::RuntimeError;
use crate::gc::Heap;
use crate::value::Value;

/// Signature for a built-in: `clock()` and friends. Takes the heap so a
/// native that allocates (e.g. a future `str()`) has somewhere to put its
/// result; `clock` itself ignores it. Matches §6/§3's "(argc, args ptr) →
/// Value" shape, with `argc` carried implicitly as `args.len()`.
pub type NativeFn = fn(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError>;

#[derive(Debug, Clone)]
pub struct NativeFunction {
    pub name: Rc<str>,
    pub arity: u8,
    pub func: NativeFn,
}

impl NativeFunction {
    pub fn new(name: Rc<str>, arity: u8, func: NativeFn) -> Self {
        Self { name, arity, func }
    }
}
