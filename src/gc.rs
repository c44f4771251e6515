//! The object heap and its tracing garbage collector (§4.4).
//!
//! The teacher (`memory.rs`, `value/object/object_ref.rs`) models heap
//! objects behind raw pointers (`ObjectRef<T>`, `HeapPtr<T>`) threaded
//! through an intrusive all-objects list, with a `reallocate(old, new)`
//! accounting primitive gating every allocation. We keep that contract
//! exactly — an allocation is the only GC safe point, roots are marked
//! before sweeping, the intern table is a weak root — but realize the
//! object graph as a `Vec`-backed arena indexed by [`GcRef`] instead of raw
//! pointers. The arena's slot vector plays the role of the all-objects
//! list (iteration order = allocation order); there is no separate
//! "Dealloc" trait to run, since dropping a slot's `Obj` already runs
//! Rust's destructors for anything it owns. This trades the teacher's
//! unsafe pointer aliasing for a `Copy` index with identical reachability
//! semantics, noted in DESIGN.md.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::object::{Class, Closure, Function, Instance, NativeFunction, Obj, ObjKind, Upvalue};
use crate::value::Value;

/// A `Copy` handle to a heap object. Two `GcRef`s are equal iff they name the
/// same arena slot, which is exactly object identity per §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcRef(u32);

const INITIAL_NEXT_GC: usize = 1024 * 1024;
const GC_GROWTH_FACTOR: usize = 2;

/// Owns every heap object and the intern table. One `Heap` per [`crate::vm::Vm`]
/// — the design note in §9 calling for "an explicit VM context... eliminating
/// hidden coupling" instead of a process-wide global `vm`.
pub struct Heap {
    objects: Vec<Option<Obj>>,
    free_slots: Vec<u32>,
    strings: HashMap<Rc<str>, GcRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free_slots: Vec::new(),
            strings: HashMap::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Whether the next allocation site should run a collection, per the
    /// growth-threshold heuristic (or always, under `stress_gc`).
    pub fn should_collect(&self) -> bool {
        cfg!(feature = "stress_gc") || self.bytes_allocated > self.next_gc
    }

    fn insert(&mut self, obj: Obj) -> GcRef {
        self.bytes_allocated += obj.approx_size();
        if let Some(slot) = self.free_slots.pop() {
            self.objects[slot as usize] = Some(obj);
            GcRef(slot)
        } else {
            self.objects.push(Some(obj));
            GcRef((self.objects.len() - 1) as u32)
        }
    }

    fn get(&self, r: GcRef) -> &Obj {
        self.objects[r.0 as usize].as_ref().expect("dangling GcRef: object already collected")
    }

    fn get_mut(&mut self, r: GcRef) -> &mut Obj {
        self.objects[r.0 as usize].as_mut().expect("dangling GcRef: object already collected")
    }

    pub fn kind(&self, r: GcRef) -> &ObjKind {
        &self.get(r).kind
    }

    pub fn kind_mut(&mut self, r: GcRef) -> &mut ObjKind {
        &mut self.get_mut(r).kind
    }

    // ---- typed accessors -------------------------------------------------
    // Mirrors clox's AS_STRING/AS_CLOSURE macros: callers are expected to have
    // already checked the type (via a runtime-error path for guest-visible
    // mismatches, or by construction for VM-internal invariants). A mismatch
    // here is a host bug, hence the panic rather than a `RuntimeError`.

    pub fn as_str(&self, r: GcRef) -> &Rc<str> {
        match &self.get(r).kind {
            ObjKind::Str(s) => s,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    pub fn as_function(&self, r: GcRef) -> &Function {
        match &self.get(r).kind {
            ObjKind::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn as_function_mut(&mut self, r: GcRef) -> &mut Function {
        match &mut self.get_mut(r).kind {
            ObjKind::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn as_closure(&self, r: GcRef) -> &Closure {
        match &self.get(r).kind {
            ObjKind::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_name()),
        }
    }

    pub fn as_closure_mut(&mut self, r: GcRef) -> &mut Closure {
        match &mut self.get_mut(r).kind {
            ObjKind::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_name()),
        }
    }

    pub fn as_class(&self, r: GcRef) -> &Class {
        match &self.get(r).kind {
            ObjKind::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn as_class_mut(&mut self, r: GcRef) -> &mut Class {
        match &mut self.get_mut(r).kind {
            ObjKind::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn as_instance(&self, r: GcRef) -> &Instance {
        match &self.get(r).kind {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn as_instance_mut(&mut self, r: GcRef) -> &mut Instance {
        match &mut self.get_mut(r).kind {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn as_native(&self, r: GcRef) -> &NativeFunction {
        match &self.get(r).kind {
            ObjKind::Native(n) => n,
            other => panic!("expected native function, found {}", other.type_name()),
        }
    }

    pub fn as_upvalue(&self, r: GcRef) -> &Upvalue {
        match &self.get(r).kind {
            ObjKind::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn as_upvalue_mut(&mut self, r: GcRef) -> &mut Upvalue {
        match &mut self.get_mut(r).kind {
            ObjKind::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    // ---- allocation --------------------------------------------------

    /// Canonicalizes a byte sequence to a single interned `String` object
    /// (§6's `copyString`/`takeString`, collapsed into one entry point: Rust
    /// ownership means there is never a buffer to "take" versus "copy").
    pub fn intern(&mut self, s: &str) -> GcRef {
        if let Some(r) = self.strings.get(s) {
            return *r;
        }
        let rc: Rc<str> = Rc::from(s);
        let r = self.insert(Obj::new(ObjKind::Str(Rc::clone(&rc))));
        self.strings.insert(rc, r);
        r
    }

    pub fn alloc_function(&mut self, f: Function) -> GcRef {
        self.insert(Obj::new(ObjKind::Function(f)))
    }

    pub fn alloc_native(&mut self, n: NativeFunction) -> GcRef {
        self.insert(Obj::new(ObjKind::Native(n)))
    }

    pub fn alloc_closure(&mut self, c: Closure) -> GcRef {
        self.insert(Obj::new(ObjKind::Closure(c)))
    }

    pub fn alloc_upvalue(&mut self, u: Upvalue) -> GcRef {
        self.insert(Obj::new(ObjKind::Upvalue(u)))
    }

    pub fn alloc_class(&mut self, c: Class) -> GcRef {
        self.insert(Obj::new(ObjKind::Class(c)))
    }

    pub fn alloc_instance(&mut self, i: Instance) -> GcRef {
        self.insert(Obj::new(ObjKind::Instance(i)))
    }

    pub fn alloc_bound_method(&mut self, b: crate::object::BoundMethod) -> GcRef {
        self.insert(Obj::new(ObjKind::BoundMethod(b)))
    }

    /// String concatenation (`ADD` on two strings): allocates a freshly
    /// interned result. Associative on equal inputs per §8's testable
    /// property, since string equality here is just byte equality under the
    /// hood of `Rc<str>`/`String` concatenation.
    pub fn concat_strings(&mut self, a: GcRef, b: GcRef) -> GcRef {
        let mut joined = String::with_capacity(self.as_str(a).len() + self.as_str(b).len());
        joined.push_str(self.as_str(a));
        joined.push_str(self.as_str(b));
        self.intern(&joined)
    }

    pub fn display_obj(&self, r: GcRef, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.get(r).kind {
            ObjKind::Str(s) => f.write_str(s),
            ObjKind::Function(func) => match func.name {
                Some(name) => write!(f, "<fn {}>", self.as_str(name)),
                None => f.write_str("<script>"),
            },
            ObjKind::Native(n) => write!(f, "<native fn {}>", n.name),
            ObjKind::Closure(c) => {
                let func = self.as_function(c.function);
                match func.name {
                    Some(name) => write!(f, "<fn {}>", self.as_str(name)),
                    None => f.write_str("<script>"),
                }
            }
            ObjKind::Upvalue(_) => f.write_str("upvalue"),
            ObjKind::Class(c) => write!(f, "{}", self.as_str(c.name)),
            ObjKind::Instance(i) => write!(f, "{} instance", self.as_str(self.as_class(i.class).name)),
            ObjKind::BoundMethod(b) => {
                let closure = self.as_closure(b.method);
                let func = self.as_function(closure.function);
                match func.name {
                    Some(name) => write!(f, "<fn {}>", self.as_str(name)),
                    None => f.write_str("<script>"),
                }
            }
        }
    }

    /// Name used in a stack-trace frame line: the function's name, or
    /// `"script"` for the implicit top-level frame.
    pub fn function_name(&self, function: GcRef) -> String {
        match self.as_function(function).name {
            Some(name) => format!("{}()", self.as_str(name)),
            None => "script".to_string(),
        }
    }

    // ---- collection ----------------------------------------------------

    /// Marks `r` and, transitively, everything it references. Idempotent:
    /// already-marked objects are not re-walked, which also breaks cycles
    /// (instances <-> classes <-> method closures can form genuine cycles,
    /// §9).
    fn mark(&mut self, r: GcRef) {
        if self.objects[r.0 as usize].as_ref().unwrap().header.marked {
            return;
        }
        self.objects[r.0 as usize].as_mut().unwrap().header.marked = true;

        // Collect child refs first to avoid holding a borrow across recursive marks.
        let children = self.children_of(r);
        for child in children {
            self.mark(child);
        }
    }

    fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark(r);
        }
    }

    fn children_of(&self, r: GcRef) -> Vec<GcRef> {
        match &self.get(r).kind {
            ObjKind::Str(_) | ObjKind::Native(_) => Vec::new(),
            ObjKind::Function(f) => {
                let mut out: Vec<GcRef> = f.chunk.constants().iter().filter_map(|v| v.as_obj()).collect();
                out.extend(f.name);
                out
            }
            ObjKind::Closure(c) => {
                let mut out = vec![c.function];
                out.extend(c.upvalues.iter().copied());
                out
            }
            ObjKind::Upvalue(u) => match u {
                Upvalue::Open(_) => Vec::new(),
                Upvalue::Closed(v) => v.as_obj().into_iter().collect(),
            },
            ObjKind::Class(c) => {
                let mut out = vec![c.name];
                out.extend(c.methods.values().copied());
                out
            }
            ObjKind::Instance(i) => {
                let mut out = vec![i.class];
                out.extend(i.fields.values().filter_map(|v| v.as_obj()));
                out
            }
            ObjKind::BoundMethod(b) => {
                let mut out = vec![b.method];
                out.extend(b.receiver.as_obj());
                out
            }
        }
    }

    /// Sweeps every unmarked slot, clears mark bits for the next cycle, and
    /// purges intern-table entries whose string was collected (the "weak
    /// root" clause in §3).
    fn sweep(&mut self) {
        for (idx, slot) in self.objects.iter_mut().enumerate() {
            if let Some(obj) = slot {
                if obj.header.marked {
                    obj.header.marked = false;
                } else {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.approx_size());
                    *slot = None;
                    self.free_slots.push(idx as u32);
                }
            }
        }
        self.strings.retain(|_, r| self.objects[r.0 as usize].is_some());
    }

    /// Runs one full mark-sweep collection against the roots a
    /// [`crate::vm::Vm`] hands it (value stack, call frames' closures, open
    /// upvalues, globals, the `"init"` sentinel). Called from allocation
    /// sites per the GC safe-point contract in §4.4; never mid-instruction.
    pub fn collect(&mut self, roots: GcRoots<'_>) {
        let before = self.bytes_allocated;
        log::debug!("gc: begin collection, {before} bytes allocated");

        for &v in roots.stack {
            self.mark_value(v);
        }
        for &closure in roots.frame_closures {
            self.mark(closure);
        }
        for &upvalue in roots.open_upvalues {
            self.mark(upvalue);
        }
        for &v in roots.globals {
            self.mark_value(v);
        }
        if let Some(init) = roots.init_string {
            self.mark(init);
        }

        self.sweep();
        self.next_gc = (self.bytes_allocated.max(1)) * GC_GROWTH_FACTOR;
        log::debug!(
            "gc: end collection, {} -> {} bytes, next at {} bytes",
            before,
            self.bytes_allocated,
            self.next_gc
        );
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of everything [`Heap::collect`] must treat as a GC root,
/// borrowed from [`crate::vm::Vm`] for the duration of one collection.
pub struct GcRoots<'a> {
    pub stack: &'a [Value],
    pub frame_closures: &'a [GcRef],
    pub open_upvalues: &'a [GcRef],
    pub globals: std::collections::hash_map::Values<'a, Rc<str>, Value>,
    pub init_string: Option<GcRef>,
}
