//! The compiler is an external collaborator (§1, §6): this crate only
//! defines the seam it plugs into. `Vm::interpret` is generic over an
//! implementation of [`Compile`] so the core can be built, tested, and
//! shipped without a parser of its own.

use crate::error::CompileError;
use crate::gc::{GcRef, Heap};

/// `compile(source_text) -> Function | CompileError`, per §6. Implementors
/// allocate the compiled top-level function (and everything it transitively
/// owns — nested functions, constants, interned names) directly on the
/// supplied `Heap` and return a [`GcRef`] to it.
pub trait Compile {
    fn compile(&self, source: &str, heap: &mut Heap) -> Result<GcRef, CompileError>;
}
