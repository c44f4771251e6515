//! Built-in natives (§6). Only `clock()` is in scope — "a standard library
//! beyond a `clock()` builtin" is an explicit non-goal. Grounded on the
//! teacher's `std_lib/time.rs`, which wraps a process-start `Instant` the
//! same way.

use std::time::Instant;

use crate::error::RuntimeError;
use crate::gc::Heap;
use crate::value::Value;

/// Lazily captures the moment the VM (or at least this module) first runs,
/// so `clock()` returns process-relative seconds the way clox's
/// `(double)clock() / CLOCKS_PER_SEC` does.
fn start_time() -> Instant {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

pub fn clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(start_time().elapsed().as_secs_f64()))
}
