//! Execution core for a small class-based bytecode virtual machine: tagged
//! values, heap objects, a tracing collector, bytecode chunks, call frames,
//! and the dispatch-loop interpreter (closures, upvalues, classes, single
//! inheritance, bound methods).
//!
//! The compiler that turns source text into bytecode is an external
//! collaborator — see [`compiler::Compile`] — so this crate has no lexer or
//! parser of its own; [`asm::ChunkBuilder`] stands in for it in tests.

pub mod asm;
pub mod chunk;
pub mod compiler;
pub mod error;
pub mod frame;
pub mod gc;
pub mod native;
pub mod object;
pub mod value;
pub mod vm;

pub use error::{CompileError, InterpretResult, RuntimeError};
pub use gc::{GcRef, Heap};
pub use value::Value;
pub use vm::Vm;
