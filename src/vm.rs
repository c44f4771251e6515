//! The interpreter: dispatch loop over bytecode, call frames, closures,
//! classes, and method dispatch (§4.3). This is the heart of the CORE.

use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use crate::chunk::OpCode;
use crate::compiler::Compile;
use crate::error::{InterpretResult, RuntimeError};
use crate::frame::CallFrame;
use crate::gc::{GcRef, GcRoots, Heap};
use crate::object::{BoundMethod, Class, Closure, Instance, NativeFunction, ObjKind, Upvalue};
use crate::value::{Value, ValueFmt};

pub const FRAMES_MAX: usize = 64;

type OpResult<T> = Result<T, RuntimeError>;

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<Rc<str>, Value>,
    /// Sorted by strictly decreasing stack slot, per §3's open-upvalue-list
    /// invariant. A `Vec` substitutes for the teacher's intrusive linked
    /// list of raw pointers (`value/object/upvalue.rs`); same ordering
    /// invariant and sharing behavior, no unsafe aliasing — see DESIGN.md.
    open_upvalues: Vec<GcRef>,
    init_string: GcRef,
    /// Where `OP_PRINT` writes (§6: "stdout for print"). Boxed so tests can
    /// swap in an in-memory buffer instead of the real stdout.
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Same as [`Self::new`] but `OP_PRINT` writes to `output` instead of
    /// stdout — used by tests that assert on printed text.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            init_string,
            output,
        };
        vm.define_native("clock", 0, crate::native::clock);
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Exposes the heap for test/tooling code that assembles bytecode
    /// directly against this VM's arena (see [`crate::asm::ChunkBuilder`]).
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn define_native(&mut self, name: &str, arity: u8, func: crate::object::NativeFn) {
        let name_ref = self.heap.intern(name);
        let native = NativeFunction::new(Rc::clone(self.heap.as_str(name_ref)), arity, func);
        let obj = self.heap.alloc_native(native);
        self.globals.insert(Rc::clone(self.heap.as_str(name_ref)), Value::Obj(obj));
    }

    /// §6: `interpret(source) -> Ok | CompileError | RuntimeError`. Wraps the
    /// compiled top-level `Function` in a `Closure`, installs it as frame 0
    /// with zero arguments, and dispatches until it returns or faults.
    pub fn interpret(&mut self, source: &str, compiler: &dyn Compile) -> InterpretResult {
        let function = match compiler.compile(source, &mut self.heap) {
            Ok(f) => f,
            Err(e) => return InterpretResult::CompileError(e),
        };
        self.push(Value::Obj(function));
        self.collect_if_needed();
        let closure = self.heap.alloc_closure(Closure::new(function, 0));
        self.pop();
        self.push(Value::Obj(closure));
        if let Err(e) = self.call(closure, 0) {
            return InterpretResult::RuntimeError(e);
        }
        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(e) => InterpretResult::RuntimeError(e),
        }
    }

    /// Entry point used by tests that hand-assemble a pre-compiled
    /// top-level function instead of going through [`Compile`].
    pub fn interpret_function(&mut self, function: GcRef) -> Result<(), RuntimeError> {
        self.push(Value::Obj(function));
        self.collect_if_needed();
        let closure = self.heap.alloc_closure(Closure::new(function, 0));
        self.pop();
        self.push(Value::Obj(closure));
        self.call(closure, 0)?;
        self.run()
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop from empty stack: compiler stack-effect contract violated")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn collect_if_needed(&mut self) {
        if self.heap.should_collect() {
            let frame_closures: Vec<GcRef> = self.frames.iter().map(|f| f.closure).collect();
            let roots = GcRoots {
                stack: &self.stack,
                frame_closures: &frame_closures,
                open_upvalues: &self.open_upvalues,
                globals: self.globals.values(),
                init_string: Some(self.init_string),
            };
            self.heap.collect(roots);
        }
    }

    // ---- call protocol (§4.3 "Call protocol") -------------------------

    fn call(&mut self, closure: GcRef, argc: u8) -> OpResult<()> {
        let function = self.heap.as_closure(closure).function;
        let arity = self.heap.as_function(function).arity;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame::new(closure, slots_base));
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> OpResult<()> {
        let Value::Obj(r) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match self.heap.kind(r) {
            ObjKind::BoundMethod(_) => {
                let bound = match self.heap.kind(r) {
                    ObjKind::BoundMethod(b) => BoundMethod { receiver: b.receiver, method: b.method },
                    _ => unreachable!(),
                };
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = bound.receiver;
                self.call(bound.method, argc)
            }
            ObjKind::Class(_) => {
                self.collect_if_needed();
                let instance = self.heap.alloc_instance(Instance::new(r));
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Obj(instance);
                let initializer = self.heap.as_class(r).methods.get(self.heap.as_str(self.init_string)).copied();
                match initializer {
                    Some(init) => self.call(init, argc),
                    None if argc != 0 => {
                        Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
                    }
                    None => Ok(()),
                }
            }
            ObjKind::Closure(_) => self.call(r, argc),
            ObjKind::Native(_) => {
                let (native, arity) = match self.heap.kind(r) {
                    ObjKind::Native(n) => (n.func, n.arity),
                    _ => unreachable!(),
                };
                if argc != arity {
                    return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
                }
                let start = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[start..].to_vec();
                let result = (native)(&mut self.heap, &args).map_err(|e| self.attach_trace(e))?;
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn invoke_from_class(&mut self, class: GcRef, name: GcRef, argc: u8) -> OpResult<()> {
        let method = self.heap.as_class(class).methods.get(self.heap.as_str(name)).copied();
        match method {
            Some(m) => self.call(m, argc),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", self.heap.as_str(name)))),
        }
    }

    fn invoke(&mut self, name: GcRef, argc: u8) -> OpResult<()> {
        let receiver = self.peek(argc as usize);
        let Value::Obj(r) = receiver else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let ObjKind::Instance(_) = self.heap.kind(r) else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        if let Some(value) = self.heap.as_instance(r).fields.get(self.heap.as_str(name)).copied() {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        let class = self.heap.as_instance(r).class;
        self.invoke_from_class(class, name, argc)
    }

    fn bind_method(&mut self, class: GcRef, name: GcRef) -> OpResult<()> {
        let method = self.heap.as_class(class).methods.get(self.heap.as_str(name)).copied();
        match method {
            Some(m) => {
                self.collect_if_needed();
                let receiver = self.peek(0);
                let bound = self.heap.alloc_bound_method(BoundMethod::new(receiver, m));
                self.pop();
                self.push(Value::Obj(bound));
                Ok(())
            }
            None => Err(self.runtime_error(format!("Undefined property '{}'.", self.heap.as_str(name)))),
        }
    }

    // ---- upvalues (§4.3 "Upvalue capture"/"Upvalue closing") ----------

    fn capture_upvalue(&mut self, stack_slot: usize) -> GcRef {
        if let Some(&existing) = self
            .open_upvalues
            .iter()
            .find(|&&r| self.heap.as_upvalue(r).stack_slot() == Some(stack_slot))
        {
            return existing;
        }
        self.collect_if_needed();
        let created = self.heap.alloc_upvalue(Upvalue::Open(stack_slot));
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|&r| self.heap.as_upvalue(r).stack_slot().unwrap_or(0) < stack_slot)
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, created);
        created
    }

    fn close_upvalues(&mut self, from: usize) {
        while let Some(&top) = self.open_upvalues.first() {
            let slot = match self.heap.as_upvalue(top) {
                Upvalue::Open(slot) => *slot,
                Upvalue::Closed(_) => break,
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.as_upvalue_mut(top) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ---- errors ---------------------------------------------------------

    /// Formats a message, appends `[line L] in <name>()` for every live frame
    /// (innermost first), resets the stacks, and returns the error (§4.3
    /// "Runtime error").
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut err = RuntimeError::new(message.into());
        err.trace = self.build_trace();
        self.reset_stack();
        err
    }

    /// Attaches a stack trace to an error raised by a native function
    /// (outside the opcode dispatch loop) and resets the stacks the same way
    /// a dispatch-loop runtime error would.
    fn attach_trace(&mut self, mut err: RuntimeError) -> RuntimeError {
        err.trace = self.build_trace();
        self.reset_stack();
        err
    }

    fn build_trace(&self) -> Vec<String> {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = self.heap.as_closure(frame.closure).function;
            let line = self.heap.as_function(function).chunk.line(frame.ip.saturating_sub(1));
            trace.push(format!("[line {line}] in {}", self.heap.function_name(function)));
        }
        trace
    }

    // ---- dispatch loop (§4.3) -------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let (closure, ip) = {
            let frame = self.frames.last().unwrap();
            (frame.closure, frame.ip)
        };
        let function = self.heap.as_closure(closure).function;
        let byte = self.heap.as_function(function).chunk.read(ip);
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        (u16::from(hi) << 8) | u16::from(lo)
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let frame = self.frames.last().unwrap();
        let function = self.heap.as_closure(frame.closure).function;
        self.heap.as_function(function).chunk.get_constant(idx)
    }

    fn read_string(&mut self) -> GcRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("compiler always emits string constants for name operands"),
        }
    }

    fn current_chunk_len(&self) -> usize {
        let frame = self.frames.last().unwrap();
        let function = self.heap.as_closure(frame.closure).function;
        self.heap.as_function(function).chunk.len()
    }

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.frames.is_empty() {
                return Ok(());
            }

            #[cfg(feature = "trace_execution")]
            self.trace_instruction();

            let ip = self.frames.last().unwrap().ip;
            if ip >= self.current_chunk_len() {
                return Ok(());
            }

            let op = OpCode::from_byte(self.read_byte());
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
                    let base = self.frames.last().unwrap().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let key = Rc::clone(self.heap.as_str(name));
                    match self.globals.get(&key).copied() {
                        Some(v) => self.push(v),
                        None => return Err(self.runtime_error(format!("Undefined variable '{key}'."))),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let key = Rc::clone(self.heap.as_str(name));
                    let v = self.pop();
                    self.globals.insert(key, v);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let key = Rc::clone(self.heap.as_str(name));
                    if self.globals.contains_key(&key) {
                        self.globals.insert(key, self.peek(0));
                    } else {
                        return Err(self.runtime_error(format!("Undefined variable '{key}'.")));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let up = self.heap.as_closure(closure).upvalues[slot];
                    let v = match self.heap.as_upvalue(up) {
                        Upvalue::Open(s) => self.stack[*s],
                        Upvalue::Closed(v) => *v,
                    };
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let up = self.heap.as_closure(closure).upvalues[slot];
                    let v = self.peek(0);
                    match self.heap.as_upvalue_mut(up) {
                        Upvalue::Open(s) => self.stack[*s] = v,
                        slot_ref @ Upvalue::Closed(_) => *slot_ref = Upvalue::Closed(v),
                    }
                }
                OpCode::GetProperty => {
                    let receiver = self.peek(0);
                    let Value::Obj(r) = receiver else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    if !matches!(self.heap.kind(r), ObjKind::Instance(_)) {
                        return Err(self.runtime_error("Only instances have properties."));
                    }
                    let name = self.read_string();
                    let field = self.heap.as_instance(r).fields.get(self.heap.as_str(name)).copied();
                    match field {
                        Some(v) => {
                            self.pop();
                            self.push(v);
                        }
                        None => {
                            let class = self.heap.as_instance(r).class;
                            self.bind_method(class, name)?;
                        }
                    }
                }
                OpCode::SetProperty => {
                    let receiver = self.peek(1);
                    let Value::Obj(r) = receiver else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    if !matches!(self.heap.kind(r), ObjKind::Instance(_)) {
                        return Err(self.runtime_error("Only instances have fields."));
                    }
                    let name = self.read_string();
                    let key = Rc::clone(self.heap.as_str(name));
                    let value = self.peek(0);
                    self.heap.as_instance_mut(r).fields.insert(key, value);
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(r) if matches!(self.heap.kind(r), ObjKind::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.number_binary_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.number_binary_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => {
                    let (b, a) = (self.peek(0), self.peek(1));
                    match (a, b) {
                        (Value::Obj(ra), Value::Obj(rb))
                            if matches!(self.heap.kind(ra), ObjKind::Str(_))
                                && matches!(self.heap.kind(rb), ObjKind::Str(_)) =>
                        {
                            self.collect_if_needed();
                            let result = self.heap.concat_strings(ra, rb);
                            self.pop();
                            self.pop();
                            self.push(Value::Obj(result));
                        }
                        (Value::Number(na), Value::Number(nb)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(na + nb));
                        }
                        _ => return Err(self.runtime_error("Operands must be two numbers or two strings.")),
                    }
                }
                OpCode::Subtract => self.number_binary_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.number_binary_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.number_binary_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Print => {
                    let v = self.pop();
                    let _ = writeln!(self.output, "{}", ValueFmt { value: v, heap: &self.heap });
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = match self.pop() {
                        Value::Obj(r) if matches!(self.heap.kind(r), ObjKind::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => {
                    let constant = self.read_constant();
                    let Value::Obj(function) = constant else {
                        unreachable!("compiler always emits a function constant for OP_CLOSURE")
                    };
                    let upvalue_count = self.heap.as_function(function).upvalue_count as usize;
                    self.collect_if_needed();
                    let closure_ref = self.heap.alloc_closure(Closure::new(function, upvalue_count));
                    self.push(Value::Obj(closure_ref));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let captured = if is_local {
                            let base = self.frames.last().unwrap().slots_base;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            self.heap.as_closure(enclosing).upvalues[index]
                        };
                        self.heap.as_closure_mut(closure_ref).upvalues.push(captured);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slots_base = self.frames.last().unwrap().slots_base;
                    self.close_upvalues(slots_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(slots_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    self.collect_if_needed();
                    let class = self.heap.alloc_class(Class::new(name));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let Value::Obj(super_ref) = superclass else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    if !matches!(self.heap.kind(super_ref), ObjKind::Class(_)) {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    let Value::Obj(sub_ref) = self.peek(0) else { unreachable!() };
                    let inherited = self.heap.as_class(super_ref).methods.clone();
                    self.heap.as_class_mut(sub_ref).methods.extend(inherited);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let key = Rc::clone(self.heap.as_str(name));
                    let method = self.pop();
                    let Value::Obj(class_ref) = self.peek(0) else { unreachable!() };
                    let Value::Obj(method_ref) = method else { unreachable!() };
                    self.heap.as_class_mut(class_ref).methods.insert(key, method_ref);
                }
            }
        }
    }

    fn number_binary_op(&mut self, op: impl Fn(f64, f64) -> Value) -> OpResult<()> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(op(a, b));
        Ok(())
    }

    #[cfg(feature = "trace_execution")]
    fn trace_instruction(&self) {
        let mut line = String::from("          ");
        for v in &self.stack {
            line.push_str(&format!("[ {} ]", ValueFmt { value: *v, heap: &self.heap }));
        }
        log::trace!("{line}");
        let frame = self.frames.last().unwrap();
        let function = self.heap.as_closure(frame.closure).function;
        log::trace!(
            "{:04} op at {}",
            frame.ip,
            self.heap.as_function(function).chunk.line(frame.ip.min(self.current_chunk_len().saturating_sub(1)))
        );
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Used by tests and the non-existent-in-core compiler boundary: the
/// sentinel name used for constructors, mirroring clox's `vm.initString`.
pub const INIT_METHOD_NAME: &str = "init";
