//! Bytecode chunk: instruction stream, constant pool, source map.
//!
//! A [`ChunkBuilder`] accumulates an append-only byte stream (built by
//! a compiler, or by test fixtures standing in for one); [`finish`]
//! freezes it into an immutable [`Chunk`] the dispatcher executes
//! against. Every opcode's operand layout is fixed by its variant;
//! there is no operand count prefix.

pub mod source_map;

pub use source_map::SourceMap;

use crate::error::{OrusError, OrusResult, SourceLocation};
use crate::register::RegisterId;

/// One instruction. Three families, matching the dispatcher's three
/// decode paths: boxed/general, typed fast path, and fused control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::FromRepr)]
#[repr(u8)]
pub enum Opcode {
    // --- boxed/general -----------------------------------------------------
    /// `dst(Reg) idx(u16)`
    LoadConst,
    /// `dst(Reg)`
    LoadNil,
    /// `dst(Reg)`
    LoadTrue,
    /// `dst(Reg)`
    LoadFalse,
    /// `dst(Reg) src(Reg)`
    Move,
    /// `dst(Reg) func_const(u16) arg_base(Reg) arg_count(u8)`
    Call,
    /// `dst(Reg) native_id(u16) arg_base(Reg) arg_count(u8)`
    CallNative,
    /// `func_const(u16) arg_base(Reg) arg_count(u8)` — reuses the active frame.
    TailCall,
    /// `src(Reg)`
    Return,
    ReturnVoid,
    /// `dst(Reg) a(Reg) b(Reg)`
    Concat,
    /// `offset(i16)` — unconditional, relative to the byte after the operand.
    Jump,
    /// `offset(u8)` — unconditional, forward only.
    JumpShort,
    /// `pred(Reg) offset(i16)` — jump if `!pred.truthy()`.
    JumpIfNot,
    /// `pred(Reg) offset(u8)` — short form, forward only.
    JumpIfNotShort,
    /// `dst(Reg) arg_base(Reg) arg_count(u16)`
    MakeArray,
    /// `array(Reg) value(Reg)`
    ArrayPush,
    /// `dst(Reg) src(Reg)` — range or array to its iterator object.
    GetIter,
    /// `iter(Reg) dst(Reg) has_value(Reg)`
    IterNext,
    /// `src(Reg)`
    Print,
    /// `a(Reg) b(Reg)`
    AssertEq,
    /// No operands. Synthetic: carries [`SourceLocation::SYNTHETIC`].
    Halt,

    // --- typed fast path -----------------------------------------------------
    /// `dst(Reg) idx(u16)`
    LoadI32Const,
    LoadI64Const,
    LoadU32Const,
    LoadU64Const,
    LoadF64Const,

    /// `dst(Reg) a(Reg) b(Reg)`, one opcode per (op, kind) pair.
    AddI32Typed,
    SubI32Typed,
    MulI32Typed,
    DivI32Typed,
    ModI32Typed,
    AddI64Typed,
    SubI64Typed,
    MulI64Typed,
    DivI64Typed,
    ModI64Typed,
    AddU32Typed,
    SubU32Typed,
    MulU32Typed,
    DivU32Typed,
    ModU32Typed,
    AddU64Typed,
    SubU64Typed,
    MulU64Typed,
    DivU64Typed,
    ModU64Typed,
    AddF64Typed,
    SubF64Typed,
    MulF64Typed,
    DivF64Typed,
    ModF64Typed,

    /// `reg(Reg)` — in-place typed increment/decrement.
    IncI32R,
    DecI32R,
    IncI64R,
    DecI64R,
    IncU32R,
    DecU32R,
    IncU64R,
    DecU64R,

    /// `dst(Reg) a(Reg) b(Reg)` — writes a typed Bool.
    LtI32Typed,
    LtI64Typed,
    LtU32Typed,
    LtU64Typed,
    LtF64Typed,
    EqI32Typed,
    EqI64Typed,
    EqU32Typed,
    EqU64Typed,
    EqF64Typed,

    /// `pred(Reg) offset(i16)` — reads a typed Bool register directly.
    JumpIfNotBoolTyped,

    // --- fused control -----------------------------------------------------
    /// `counter(Reg) limit(Reg) offset(i16)`
    IncCmpJmp,
    /// `counter(Reg) limit(Reg) offset(i16)`
    DecCmpJmp,

    /// `reg(Reg)` — parameter type guard emitted into a specialized
    /// function chunk's prelude. A mismatch between the boxed value's
    /// kind and the guarded kind deopts the call back to the baseline
    /// chunk rather than letting the rest of the (kind-specialized)
    /// body run against the wrong assumption.
    GuardI32,
    GuardI64,
    GuardU32,
    GuardU64,
    GuardF64,
}

impl Opcode {
    pub fn decode(byte: u8) -> OrusResult<Opcode> {
        Opcode::from_repr(byte).ok_or_else(|| OrusError::MalformedChunk(format!("unknown opcode byte {byte:#04x}")))
    }

    /// Number of operand bytes following the opcode byte itself.
    pub fn operand_len(self) -> usize {
        use Opcode::*;
        match self {
            ReturnVoid | Halt => 0,
            JumpShort => 1,
            LoadNil | LoadTrue | LoadFalse | Return | Print => 2,
            Jump => 2,
            IncI32R | DecI32R | IncI64R | DecI64R | IncU32R | DecU32R | IncU64R | DecU64R => 2,
            GuardI32 | GuardI64 | GuardU32 | GuardU64 | GuardF64 => 2,
            JumpIfNotShort => 3,
            LoadConst | LoadI32Const | LoadI64Const | LoadU32Const | LoadU64Const | LoadF64Const => 4,
            Move | ArrayPush | GetIter | AssertEq => 4,
            JumpIfNot | JumpIfNotBoolTyped => 4,
            TailCall => 5,
            Concat | IterNext | MakeArray => 6,
            AddI32Typed | SubI32Typed | MulI32Typed | DivI32Typed | ModI32Typed
            | AddI64Typed | SubI64Typed | MulI64Typed | DivI64Typed | ModI64Typed
            | AddU32Typed | SubU32Typed | MulU32Typed | DivU32Typed | ModU32Typed
            | AddU64Typed | SubU64Typed | MulU64Typed | DivU64Typed | ModU64Typed
            | AddF64Typed | SubF64Typed | MulF64Typed | DivF64Typed | ModF64Typed
            | LtI32Typed | LtI64Typed | LtU32Typed | LtU64Typed | LtF64Typed
            | EqI32Typed | EqI64Typed | EqU32Typed | EqU64Typed | EqF64Typed => 6,
            IncCmpJmp | DecCmpJmp => 6,
            Call | CallNative => 7,
        }
    }
}

/// A constant-pool entry. Strings are materialized onto the heap each
/// time `LOAD_CONST` executes; interning is left to the bytecode
/// producer (a repeated string constant is simply a repeated pool
/// entry).
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Bool(bool),
    Str(String),
    Nil,
    /// Index into the owning program's function table, used by `CALL`
    /// and `TAIL_CALL`.
    FunctionIndex(u32),
}

/// An operand written by [`ChunkBuilder::emit`]. Every encoded width
/// is big-endian; register ids always occupy 2 bytes.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    Reg(RegisterId),
    U8(u8),
    U16(u16),
    I16(i16),
}

#[derive(Debug, Default)]
pub struct ChunkBuilder {
    code: Vec<u8>,
    constants: Vec<Constant>,
    source_map: SourceMap,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Append one instruction: the opcode byte, then each operand in
    /// order. Returns the opcode byte's offset (used as a jump target
    /// or a patch anchor).
    pub fn emit(&mut self, op: Opcode, operands: &[Operand], location: SourceLocation) -> usize {
        let offset = self.code.len();
        self.source_map.record(offset, location);
        self.code.push(op as u8);
        for operand in operands {
            match *operand {
                Operand::Reg(r) => self.code.extend_from_slice(&r.raw().to_be_bytes()),
                Operand::U8(b) => self.code.push(b),
                Operand::U16(v) => self.code.extend_from_slice(&v.to_be_bytes()),
                Operand::I16(v) => self.code.extend_from_slice(&v.to_be_bytes()),
            }
        }
        offset
    }

    /// Overwrite a previously-emitted `i16` operand at `offset` (used
    /// to backpatch a forward jump once its target is known).
    pub fn patch_i16(&mut self, offset: usize, value: i16) {
        let bytes = value.to_be_bytes();
        self.code[offset] = bytes[0];
        self.code[offset + 1] = bytes[1];
    }

    pub fn add_constant(&mut self, constant: Constant) -> OrusResult<u16> {
        let idx = self.constants.len();
        let idx16 = u16::try_from(idx)
            .map_err(|_| OrusError::MalformedChunk("constant pool exceeded 65536 entries".into()))?;
        self.constants.push(constant);
        Ok(idx16)
    }

    /// Splice another chunk's full instruction stream onto the end of
    /// this builder, for use only while this builder is otherwise
    /// empty of constants: `other`'s constant-pool indices are
    /// preserved verbatim by copying its pool in the same order, so
    /// any `LOAD_*_CONST` already inside `other`'s body keeps resolving
    /// to the right entry. Relative jump offsets inside `other` need
    /// no adjustment (they're relative to the byte after their own
    /// operands, not to the chunk start), so this is just a byte-level
    /// append plus a source-map shift.
    pub fn append_chunk(&mut self, other: &Chunk) -> OrusResult<()> {
        let bias = self.code.len();
        for constant in &other.constants {
            self.add_constant(constant.clone())?;
        }
        self.code.extend_from_slice(&other.code);
        self.source_map.append_shifted(&other.source_map, bias);
        Ok(())
    }

    pub fn finish(self) -> Chunk {
        Chunk {
            code: self.code,
            constants: self.constants,
            source_map: self.source_map,
        }
    }
}

/// A frozen, executable instruction stream.
#[derive(Debug)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<Constant>,
    source_map: SourceMap,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Total byte length (opcode + operands) of the instruction at `offset`.
    pub fn instruction_len(&self, offset: usize) -> OrusResult<usize> {
        Ok(1 + self.op_at(offset)?.operand_len())
    }

    pub fn op_at(&self, offset: usize) -> OrusResult<Opcode> {
        let byte = *self
            .code
            .get(offset)
            .ok_or_else(|| OrusError::MalformedChunk(format!("read past end of chunk at {offset}")))?;
        Opcode::decode(byte)
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    pub fn read_i16(&self, offset: usize) -> i16 {
        i16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    pub fn read_register(&self, offset: usize) -> RegisterId {
        RegisterId::new(self.read_u16(offset))
    }

    pub fn constant(&self, idx: u16) -> OrusResult<&Constant> {
        self.constants
            .get(usize::from(idx))
            .ok_or(OrusError::ConstantOutOfRange {
                index: idx,
                len: self.constants.len(),
            })
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    pub fn source_location(&self, offset: usize) -> SourceLocation {
        self.source_map.location_at(offset)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut Vec<u8> {
        &mut self.code
    }

    pub fn source_map_mut(&mut self) -> &mut SourceMap {
        &mut self.source_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrips_through_its_byte() {
        for op in [
            Opcode::LoadConst,
            Opcode::AddI32Typed,
            Opcode::IncCmpJmp,
            Opcode::Halt,
        ] {
            assert_eq!(Opcode::decode(op as u8).unwrap(), op);
        }
    }

    #[test]
    fn unknown_byte_is_malformed() {
        assert!(Opcode::decode(255).is_err());
    }

    #[test]
    fn emit_and_read_back_register_and_u16_operands() {
        let mut b = ChunkBuilder::new();
        let idx = b.add_constant(Constant::I32(7)).unwrap();
        let off = b.emit(
            Opcode::LoadI32Const,
            &[Operand::Reg(RegisterId::new(64)), Operand::U16(idx)],
            SourceLocation::SYNTHETIC,
        );
        let chunk = b.finish();
        assert_eq!(chunk.op_at(off).unwrap(), Opcode::LoadI32Const);
        assert_eq!(chunk.read_register(off + 1).raw(), 64);
        assert_eq!(chunk.read_u16(off + 3), idx);
        assert_eq!(chunk.constant(idx).unwrap(), &Constant::I32(7));
    }

    #[test]
    fn constant_out_of_range_is_reported() {
        let chunk = ChunkBuilder::new().finish();
        assert!(chunk.constant(0).is_err());
    }

    #[test]
    fn append_chunk_preserves_constant_indices_and_shifts_the_source_map() {
        let mut tail = ChunkBuilder::new();
        let idx = tail.add_constant(Constant::I32(9)).unwrap();
        let tail_off = tail.emit(
            Opcode::LoadI32Const,
            &[Operand::Reg(RegisterId::new(0)), Operand::U16(idx)],
            SourceLocation { file: None, line: 5, column: 1 },
        );
        let tail_chunk = tail.finish();

        let mut head = ChunkBuilder::new();
        let prelude_off = head.emit(Opcode::GuardI32, &[Operand::Reg(RegisterId::new(0))], SourceLocation::SYNTHETIC);
        let bias = head.offset();
        head.append_chunk(&tail_chunk).unwrap();
        let chunk = head.finish();

        assert_eq!(chunk.op_at(prelude_off).unwrap(), Opcode::GuardI32);
        assert_eq!(chunk.op_at(bias + tail_off).unwrap(), Opcode::LoadI32Const);
        assert_eq!(chunk.constant(0).unwrap(), &Constant::I32(9));
        assert_eq!(chunk.source_location(bias + tail_off).line, 5);
    }

    #[test]
    fn patch_i16_overwrites_a_forward_jump_target() {
        let mut b = ChunkBuilder::new();
        let jump_off = b.emit(
            Opcode::Jump,
            &[Operand::I16(0)],
            SourceLocation::SYNTHETIC,
        );
        let operand_off = jump_off + 1;
        b.patch_i16(operand_off, 42);
        let chunk = b.finish();
        assert_eq!(chunk.read_i16(operand_off), 42);
    }
}
