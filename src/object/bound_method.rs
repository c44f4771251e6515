use crate::gc::GcRef;
use crate::value::Value;

/// A method paired with the receiver it was read off of (`GET_PROPERTY`
/// binding a method instead of a field). Calling it rebinds slot 0 to
/// `receiver` before invoking the underlying closure (§4.3's call protocol).
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: GcRef,
}

impl BoundMethod {
    pub fn new(receiver: Value, method: GcRef) -> Self {
        Self { receiver, method }
    }
}
