use std::collections::HashMap;
use std::rc::Rc;

use crate::gc::GcRef;
use crate::value::Value;

/// An instance of a [`crate::object::Class`]. Fields are created on first
/// assignment (§3) — there is no declared-fields list, matching the guest
/// language's dynamic-field semantics.
#[derive(Debug)]
pub struct Instance {
    pub class: GcRef,
    pub fields: HashMap<Rc<str>, Value>,
}

impl Instance {
    pub fn new(class: GcRef) -> Self {
        Self { class, fields: HashMap::new() }
    }
}
