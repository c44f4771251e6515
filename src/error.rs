//! Error types for the interpreter core.
//!
//! The guest language has no exception mechanism: every [`RuntimeError`] aborts
//! the current [`crate::vm::Vm::interpret`] call after printing a stack trace. The
//! compiler lives outside this crate (see [`crate::compiler::Compile`]); it only
//! contributes [`CompileError`] as an opaque failure value.

use thiserror::Error;

/// Failure from the (external) compiler. The core never starts a frame when this
/// is returned from [`crate::compiler::Compile::compile`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CompileError(pub String);

/// A guest-language runtime error: a message plus the call-stack trace captured
/// at the point of failure, innermost frame first.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), trace: Vec::new() }
    }

    /// Full diagnostic text: the message followed by one `[line L] in <name>()`
    /// line per live frame, innermost first.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for line in &self.trace {
            out.push('\n');
            out.push_str(line);
        }
        out
    }
}

/// Outcome of [`crate::vm::Vm::interpret`], matching §6's `interpret(source)` contract.
#[derive(Debug)]
pub enum InterpretResult {
    Ok,
    CompileError(CompileError),
    RuntimeError(RuntimeError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
