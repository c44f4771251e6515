//! A small bytecode assembler (§4.7). The real compiler lives outside this
//! crate; this lets tests hand-assemble [`crate::chunk::Chunk`]s for the
//! scenarios in the testable-properties list without writing a parser.
//! Grounded on the teacher's `compiler/chunk.rs` writer-method style
//! (`write_opcode`, `write_opcode_with_byte_arg`, patch-point jump backfill).

use crate::chunk::{Chunk, OpCode};
use crate::gc::{GcRef, Heap};
use crate::value::Value;

/// Index of an as-yet-unpatched two-byte jump offset.
#[derive(Debug, Clone, Copy)]
pub struct JumpPoint(usize);

#[derive(Debug, Default)]
pub struct ChunkBuilder {
    chunk: Chunk,
    line: u32,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self { chunk: Chunk::new(), line: 1 }
    }

    /// All emitted bytes are attributed to this line until changed again.
    pub fn at_line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    pub fn emit(&mut self, op: OpCode) -> &mut Self {
        self.chunk.write_op(op, self.line);
        self
    }

    pub fn emit_byte(&mut self, op: OpCode, operand: u8) -> &mut Self {
        self.chunk.write_op(op, self.line);
        self.chunk.write(operand, self.line);
        self
    }

    /// Writes a single raw byte with no opcode, for multi-byte operand
    /// tails such as `OP_CLOSURE`'s per-upvalue `(is_local, index)` pairs.
    pub fn raw_byte(&mut self, byte: u8) -> &mut Self {
        self.chunk.write(byte, self.line);
        self
    }

    /// Emits `OP_CLOSURE <fn-const>` followed by one `(is_local, index)`
    /// pair per entry in `upvalues`, matching the compiler's layout for
    /// `OP_CLOSURE` (§4.1/§4.3).
    pub fn emit_closure(&mut self, function: GcRef, upvalues: &[(bool, u8)]) -> &mut Self {
        let idx = self.function_index(function);
        self.emit_byte(OpCode::Closure, idx);
        for &(is_local, index) in upvalues {
            self.raw_byte(is_local as u8);
            self.raw_byte(index);
        }
        self
    }

    /// Appends `v` to the constant pool and emits `OP_CONSTANT <index>`.
    pub fn emit_constant(&mut self, v: Value) -> &mut Self {
        let index = self.chunk.add_constant(v);
        self.emit_byte(OpCode::Constant, index)
    }

    pub fn emit_string(&mut self, heap: &mut Heap, s: &str) -> &mut Self {
        let r = heap.intern(s);
        self.emit_constant(Value::Obj(r))
    }

    /// Interns `name` and adds it to the constant pool *without* emitting a
    /// `CONSTANT` opcode, for instructions that carry the name as their own
    /// operand (`DEFINE_GLOBAL`, `GET_GLOBAL`, `GET_PROPERTY`, `METHOD`, ...).
    pub fn name_index(&mut self, heap: &mut Heap, name: &str) -> u8 {
        let r = heap.intern(name);
        self.chunk.add_constant(Value::Obj(r))
    }

    /// Adds a function value to the constant pool (for `OP_CLOSURE`) without
    /// emitting a `CONSTANT` opcode.
    pub fn function_index(&mut self, function: GcRef) -> u8 {
        self.chunk.add_constant(Value::Obj(function))
    }

    /// Emits a two-byte-operand jump instruction with a placeholder offset
    /// and returns the patch point to fix up once the destination is known.
    pub fn emit_jump(&mut self, op: OpCode) -> JumpPoint {
        self.chunk.write_op(op, self.line);
        let point = self.chunk.len();
        self.chunk.write(0xff, self.line);
        self.chunk.write(0xff, self.line);
        JumpPoint(point)
    }

    /// Backfills a jump emitted by [`Self::emit_jump`] to land just past the
    /// current end of the chunk.
    pub fn patch_jump(&mut self, point: JumpPoint) {
        let offset = self.chunk.len() - point.0 - 2;
        let offset = u16::try_from(offset).expect("jump target too far for a 16-bit offset");
        self.chunk.patch_u16(point.0, offset);
    }

    /// Emits `OP_LOOP` back to `loop_start` (a byte offset captured earlier).
    pub fn emit_loop(&mut self, loop_start: usize) {
        self.chunk.write_op(OpCode::Loop, self.line);
        let offset = self.chunk.len() - loop_start + 2;
        let offset = u16::try_from(offset).expect("loop body too far for a 16-bit offset");
        self.chunk.write((offset >> 8) as u8, self.line);
        self.chunk.write((offset & 0xff) as u8, self.line);
    }

    pub fn current_offset(&self) -> usize {
        self.chunk.len()
    }

    pub fn finish(self) -> Chunk {
        self.chunk
    }

    /// Wraps the assembled chunk in a top-level [`crate::object::Function`]
    /// (arity 0, no upvalues) and allocates it on `heap`, returning a
    /// `GcRef` ready to hand to [`crate::vm::Vm::interpret_function`].
    pub fn finish_script(self, heap: &mut Heap) -> GcRef {
        self.finish_function(heap, 0, 0, None)
    }

    /// Wraps the assembled chunk in a [`crate::object::Function`] with the
    /// given arity/upvalue count/name and allocates it on `heap`.
    pub fn finish_function(self, heap: &mut Heap, arity: u8, upvalue_count: u8, name: Option<&str>) -> GcRef {
        let name_ref = name.map(|n| heap.intern(n));
        let mut function = crate::object::Function::new(name_ref);
        function.arity = arity;
        function.upvalue_count = upvalue_count;
        function.chunk = self.chunk;
        heap.alloc_function(function)
    }
}
