use std::collections::HashMap;
use std::rc::Rc;

use crate::gc::GcRef;

/// A guest-language class: a name and a flat method-dispatch table. `inherit`
/// (the `OP_INHERIT` handler in [`crate::vm::Vm`]) copies every entry of the
/// superclass's table into the subclass's at definition time, so method
/// lookup afterwards never needs to walk a superclass chain (§3: "flat
/// dispatch table").
#[derive(Debug)]
pub struct Class {
    pub name: GcRef,
    pub methods: HashMap<Rc<str>, GcRef>,
}

impl Class {
    pub fn new(name: GcRef) -> Self {
        Self { name, methods: HashMap::new() }
    }
}
