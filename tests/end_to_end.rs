//! The six end-to-end scenarios from the testable-properties list, each
//! hand-assembled with `ChunkBuilder` the way the (out-of-scope) compiler
//! would have emitted them, since there is no parser in this crate.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use cembral::asm::ChunkBuilder;
use cembral::chunk::OpCode;
use cembral::error::InterpretResult;
use cembral::value::Value;
use cembral::vm::{Vm, FRAMES_MAX};

/// An in-memory sink so tests can assert on what `OP_PRINT` wrote.
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

fn vm_with_capture() -> (Vm, SharedBuf) {
    // So the `log::trace!`/`log::debug!` calls in the dispatch loop and the
    // collector have a subscriber under `cargo test -- --nocapture`; harmless
    // (and a no-op past the first call) when no log filter is set.
    let _ = env_logger::try_init();
    let buf = SharedBuf::default();
    (Vm::with_output(Box::new(buf.clone())), buf)
}

/// `print 1 + 2 * 3;` -> `7`
#[test]
fn arithmetic_precedence() {
    let (mut vm, out) = vm_with_capture();
    let mut b = ChunkBuilder::new();
    b.emit_constant(Value::Number(1.0));
    b.emit_constant(Value::Number(2.0));
    b.emit_constant(Value::Number(3.0));
    b.emit(OpCode::Multiply);
    b.emit(OpCode::Add);
    b.emit(OpCode::Print);
    b.emit(OpCode::Nil);
    b.emit(OpCode::Return);
    let script = b.finish_script(vm.heap_mut());
    vm.interpret_function(script).expect("interprets cleanly");
    assert_eq!(out.text(), "7\n");
}

/// `var a = "he"; var b = "llo"; print a + b;` -> `hello`
#[test]
fn string_concat_via_globals() {
    let (mut vm, out) = vm_with_capture();
    let mut b = ChunkBuilder::new();
    let heap = vm.heap_mut();
    b.emit_string(heap, "he");
    let a_name = b.name_index(heap, "a");
    b.emit_byte(OpCode::DefineGlobal, a_name);
    b.emit_string(heap, "llo");
    let b_name = b.name_index(heap, "b");
    b.emit_byte(OpCode::DefineGlobal, b_name);
    b.emit_byte(OpCode::GetGlobal, a_name);
    b.emit_byte(OpCode::GetGlobal, b_name);
    b.emit(OpCode::Add);
    b.emit(OpCode::Print);
    b.emit(OpCode::Nil);
    b.emit(OpCode::Return);
    let script = b.finish_script(heap);
    vm.interpret_function(script).expect("interprets cleanly");
    assert_eq!(out.text(), "hello\n");
}

/// ```text
/// fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; }
/// var f = make(); print f(); print f(); print f();
/// ```
/// -> `1` / `2` / `3`, exercising shared-upvalue closing.
#[test]
fn closures_share_captured_local_across_calls() {
    let (mut vm, out) = vm_with_capture();
    let heap = vm.heap_mut();

    // inc(): upvalue 0 is `x`, captured from `make`'s frame.
    let mut inc = ChunkBuilder::new();
    inc.emit_byte(OpCode::GetUpvalue, 0);
    inc.emit_constant(Value::Number(1.0));
    inc.emit(OpCode::Add);
    inc.emit_byte(OpCode::SetUpvalue, 0);
    inc.emit(OpCode::Pop);
    inc.emit_byte(OpCode::GetUpvalue, 0);
    inc.emit(OpCode::Return);
    let inc_fn = inc.finish_function(heap, 0, 1, Some("inc"));

    // make(): local slot 1 is `x`; local slot 2 is `inc`.
    let mut make = ChunkBuilder::new();
    make.emit_constant(Value::Number(0.0)); // slot 1: x
    make.emit_closure(inc_fn, &[(true, 1)]); // slot 2: inc, capturing x
    make.emit_byte(OpCode::GetLocal, 2);
    make.emit(OpCode::Return);
    let make_fn = make.finish_function(heap, 0, 0, Some("make"));

    let mut script = ChunkBuilder::new();
    script.emit_closure(make_fn, &[]);
    let make_name = script.name_index(heap, "make");
    script.emit_byte(OpCode::DefineGlobal, make_name);

    script.emit_byte(OpCode::GetGlobal, make_name);
    script.emit_byte(OpCode::Call, 0);
    let f_name = script.name_index(heap, "f");
    script.emit_byte(OpCode::DefineGlobal, f_name);

    for _ in 0..3 {
        script.emit_byte(OpCode::GetGlobal, f_name);
        script.emit_byte(OpCode::Call, 0);
        script.emit(OpCode::Print);
    }
    script.emit(OpCode::Nil);
    script.emit(OpCode::Return);
    let script = script.finish_script(heap);

    vm.interpret_function(script).expect("interprets cleanly");
    assert_eq!(out.text(), "1\n2\n3\n");
}

/// ```text
/// class Greeter { init(n) { this.n = n; } hi() { print "hi " + this.n; } }
/// Greeter("Ada").hi();
/// ```
/// -> `hi Ada`
#[test]
fn class_init_and_method() {
    let (mut vm, out) = vm_with_capture();
    let heap = vm.heap_mut();

    let mut init = ChunkBuilder::new();
    init.emit_byte(OpCode::GetLocal, 0); // this
    init.emit_byte(OpCode::GetLocal, 1); // n
    let n_name = init.name_index(heap, "n");
    init.emit_byte(OpCode::SetProperty, n_name);
    init.emit(OpCode::Pop);
    init.emit_byte(OpCode::GetLocal, 0); // initializers implicitly return `this`
    init.emit(OpCode::Return);
    let init_fn = init.finish_function(heap, 1, 0, Some("init"));

    let mut hi = ChunkBuilder::new();
    hi.emit_string(heap, "hi ");
    hi.emit_byte(OpCode::GetLocal, 0);
    let n_name_in_hi = hi.name_index(heap, "n");
    hi.emit_byte(OpCode::GetProperty, n_name_in_hi);
    hi.emit(OpCode::Add);
    hi.emit(OpCode::Print);
    hi.emit(OpCode::Nil);
    hi.emit(OpCode::Return);
    let hi_fn = hi.finish_function(heap, 0, 0, Some("hi"));

    let mut script = ChunkBuilder::new();
    let class_name = script.name_index(heap, "Greeter");
    script.emit_byte(OpCode::Class, class_name);
    script.emit_closure(init_fn, &[]);
    let init_name = script.name_index(heap, "init");
    script.emit_byte(OpCode::Method, init_name);
    script.emit_closure(hi_fn, &[]);
    let hi_name = script.name_index(heap, "hi");
    script.emit_byte(OpCode::Method, hi_name);
    script.emit_byte(OpCode::DefineGlobal, class_name);

    script.emit_byte(OpCode::GetGlobal, class_name);
    script.emit_string(heap, "Ada");
    script.emit_byte(OpCode::Call, 1);
    script.emit_byte(OpCode::Invoke, hi_name);
    script.raw_byte(0); // argc for INVOKE
    script.emit(OpCode::Pop);
    script.emit(OpCode::Nil);
    script.emit(OpCode::Return);
    let script = script.finish_script(heap);

    vm.interpret_function(script).expect("interprets cleanly");
    assert_eq!(out.text(), "hi Ada\n");
}

/// ```text
/// class A { m() { print "A"; } }
/// class B < A { m() { super.m(); print "B"; } }
/// B().m();
/// ```
/// -> `A` / `B`, exercising single inheritance and `SUPER_INVOKE`'s
/// pop-superclass-before-dispatch discipline.
#[test]
fn single_inheritance_and_super_invoke() {
    let (mut vm, out) = vm_with_capture();
    let heap = vm.heap_mut();

    let mut a_m = ChunkBuilder::new();
    a_m.emit_string(heap, "A");
    a_m.emit(OpCode::Print);
    a_m.emit(OpCode::Nil);
    a_m.emit(OpCode::Return);
    let a_m_fn = a_m.finish_function(heap, 0, 0, Some("m"));

    // B.m: upvalue 0 is `super` (class A), captured from the script's frame.
    let mut b_m = ChunkBuilder::new();
    b_m.emit_byte(OpCode::GetLocal, 0); // this
    b_m.emit_byte(OpCode::GetUpvalue, 0); // super
    let m_name_in_bm = b_m.name_index(heap, "m");
    b_m.emit_byte(OpCode::SuperInvoke, m_name_in_bm);
    b_m.raw_byte(0); // argc
    b_m.emit(OpCode::Pop);
    b_m.emit_string(heap, "B");
    b_m.emit(OpCode::Print);
    b_m.emit(OpCode::Nil);
    b_m.emit(OpCode::Return);
    let b_m_fn = b_m.finish_function(heap, 0, 1, Some("m"));

    let mut script = ChunkBuilder::new();
    let a_name = script.name_index(heap, "A");
    script.emit_byte(OpCode::Class, a_name);
    script.emit_closure(a_m_fn, &[]);
    let m_name = script.name_index(heap, "m");
    script.emit_byte(OpCode::Method, m_name);
    script.emit_byte(OpCode::DefineGlobal, a_name);

    let b_name = script.name_index(heap, "B");
    script.emit_byte(OpCode::Class, b_name);
    script.emit_byte(OpCode::DefineGlobal, b_name);

    script.emit_byte(OpCode::GetGlobal, a_name); // "super" local, slot 1
    script.emit_byte(OpCode::GetGlobal, b_name); // subclass dup, slot 2
    script.emit(OpCode::Inherit); // pops slot 2, leaves "super" at slot 1

    script.emit_byte(OpCode::GetGlobal, b_name); // class B again, slot 2
    script.emit_closure(b_m_fn, &[(true, 1)]); // captures "super" at slot 1
    script.emit_byte(OpCode::Method, m_name);
    script.emit(OpCode::Pop); // pop class B
    script.emit(OpCode::CloseUpvalue); // close + pop "super"

    script.emit_byte(OpCode::GetGlobal, b_name);
    script.emit_byte(OpCode::Call, 0);
    script.emit_byte(OpCode::Invoke, m_name);
    script.raw_byte(0);
    script.emit(OpCode::Pop);
    script.emit(OpCode::Nil);
    script.emit(OpCode::Return);
    let script = script.finish_script(heap);

    vm.interpret_function(script).expect("interprets cleanly");
    assert_eq!(out.text(), "A\nB\n");
}

/// `fun f() { f(); } f();` -> RuntimeError "Stack overflow." with a
/// traceback of depth `FRAMES_MAX`.
#[test]
fn unbounded_recursion_overflows_the_frame_stack() {
    let (mut vm, _out) = vm_with_capture();
    let heap = vm.heap_mut();

    let mut f = ChunkBuilder::new();
    let f_name = f.name_index(heap, "f");
    f.emit_byte(OpCode::GetGlobal, f_name);
    f.emit_byte(OpCode::Call, 0);
    f.emit(OpCode::Pop);
    f.emit(OpCode::Nil);
    f.emit(OpCode::Return);
    let f_fn = f.finish_function(heap, 0, 0, Some("f"));

    let mut script = ChunkBuilder::new();
    script.emit_closure(f_fn, &[]);
    let f_name_top = script.name_index(heap, "f");
    script.emit_byte(OpCode::DefineGlobal, f_name_top);
    script.emit_byte(OpCode::GetGlobal, f_name_top);
    script.emit_byte(OpCode::Call, 0);
    script.emit(OpCode::Pop);
    script.emit(OpCode::Nil);
    script.emit(OpCode::Return);
    let script = script.finish_script(heap);

    match vm.interpret_function(script) {
        Err(err) => {
            assert_eq!(err.message, "Stack overflow.");
            assert_eq!(err.trace.len(), FRAMES_MAX);
        }
        Ok(()) => panic!("expected a stack overflow runtime error"),
    }
}

/// `x = 1;` where `x` was never declared: `SET_GLOBAL` must not leave a
/// tombstone entry behind when the name doesn't already exist (it checks
/// before inserting, rather than clox's insert-then-delete-on-miss), so a
/// later lookup of the same name is still "Undefined variable".
#[test]
fn set_global_on_an_undefined_name_leaves_no_entry_behind() {
    let (mut vm, _out) = vm_with_capture();
    let heap = vm.heap_mut();

    let mut first = ChunkBuilder::new();
    first.emit(OpCode::Nil);
    let x_name = first.name_index(heap, "x");
    first.emit_byte(OpCode::SetGlobal, x_name);
    first.emit(OpCode::Pop);
    first.emit(OpCode::Nil);
    first.emit(OpCode::Return);
    let first = first.finish_script(heap);
    match vm.interpret_function(first) {
        Err(err) => assert_eq!(err.message, "Undefined variable 'x'."),
        Ok(()) => panic!("expected an undefined-variable error"),
    }

    let heap = vm.heap_mut();
    let mut second = ChunkBuilder::new();
    let x_name_again = second.name_index(heap, "x");
    second.emit_byte(OpCode::GetGlobal, x_name_again);
    second.emit(OpCode::Pop);
    second.emit(OpCode::Nil);
    second.emit(OpCode::Return);
    let second = second.finish_script(heap);
    match vm.interpret_function(second) {
        Err(err) => assert_eq!(err.message, "Undefined variable 'x'."),
        Ok(()) => panic!("SET_GLOBAL must not have defined 'x' on its failed attempt"),
    }
}

/// ```text
/// class C { m() { print "method"; } }
/// var c = C();
/// c.m = fun() { print "field"; };
/// c.m();
/// ```
/// -> `field`, not `method`: `INVOKE` must check instance fields before
/// falling back to the class method table.
#[test]
fn invoke_prefers_an_instance_field_over_the_class_method() {
    let (mut vm, out) = vm_with_capture();
    let heap = vm.heap_mut();

    let mut method_m = ChunkBuilder::new();
    method_m.emit_string(heap, "method");
    method_m.emit(OpCode::Print);
    method_m.emit(OpCode::Nil);
    method_m.emit(OpCode::Return);
    let method_m_fn = method_m.finish_function(heap, 0, 0, Some("m"));

    let mut field_m = ChunkBuilder::new();
    field_m.emit_string(heap, "field");
    field_m.emit(OpCode::Print);
    field_m.emit(OpCode::Nil);
    field_m.emit(OpCode::Return);
    let field_m_fn = field_m.finish_function(heap, 0, 0, Some("m"));

    let mut script = ChunkBuilder::new();
    let class_name = script.name_index(heap, "C");
    script.emit_byte(OpCode::Class, class_name);
    script.emit_closure(method_m_fn, &[]);
    let m_name = script.name_index(heap, "m");
    script.emit_byte(OpCode::Method, m_name);
    script.emit_byte(OpCode::DefineGlobal, class_name);

    script.emit_byte(OpCode::GetGlobal, class_name);
    script.emit_byte(OpCode::Call, 0);
    let c_name = script.name_index(heap, "c");
    script.emit_byte(OpCode::DefineGlobal, c_name);

    script.emit_byte(OpCode::GetGlobal, c_name);
    script.emit_closure(field_m_fn, &[]);
    let m_name_field = script.name_index(heap, "m");
    script.emit_byte(OpCode::SetProperty, m_name_field);
    script.emit(OpCode::Pop);

    script.emit_byte(OpCode::GetGlobal, c_name);
    script.emit_byte(OpCode::Invoke, m_name);
    script.raw_byte(0);
    script.emit(OpCode::Pop);
    script.emit(OpCode::Nil);
    script.emit(OpCode::Return);
    let script = script.finish_script(heap);

    vm.interpret_function(script).expect("interprets cleanly");
    assert_eq!(out.text(), "field\n");
}

/// A compile failure never starts a frame and is reported as `CompileError`.
#[test]
fn compile_error_short_circuits_interpretation() {
    struct AlwaysFails;
    impl cembral::compiler::Compile for AlwaysFails {
        fn compile(&self, _source: &str, _heap: &mut cembral::gc::Heap) -> Result<cembral::gc::GcRef, cembral::error::CompileError> {
            Err(cembral::error::CompileError("unexpected token".to_string()))
        }
    }

    let mut vm = Vm::new();
    let result = vm.interpret("this is not real source", &AlwaysFails);
    assert!(matches!(result, InterpretResult::CompileError(_)));
}
