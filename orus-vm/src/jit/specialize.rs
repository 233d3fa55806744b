//! Compile-time function specialization: a guard prelude spliced ahead
//! of a function's own chunk, checking that every numeric parameter
//! still carries the kind it was observed with when the call site went
//! hot. A guard failure is handled by the dispatcher as a deopt back to
//! the unmodified baseline chunk, never as a visible error.

use crate::chunk::{Chunk, ChunkBuilder, Opcode, Operand};
use crate::dispatch::FunctionProto;
use crate::error::{OrusResult, SourceLocation};
use crate::register::{RegisterId, GLOBAL_BAND_SIZE};
use crate::value::ValueKind;

/// The guard opcode that checks `kind`, or `None` if `kind` has no
/// guard (only the five scalar numeric kinds are specialized; `Bool`
/// and reference kinds pass through the baseline chunk unguarded).
pub fn guard_opcode(kind: ValueKind) -> Option<Opcode> {
    match kind {
        ValueKind::I32 => Some(Opcode::GuardI32),
        ValueKind::I64 => Some(Opcode::GuardI64),
        ValueKind::U32 => Some(Opcode::GuardU32),
        ValueKind::U64 => Some(Opcode::GuardU64),
        ValueKind::F64 => Some(Opcode::GuardF64),
        _ => None,
    }
}

/// Build a specialized chunk for `proto`: one guard instruction per
/// parameter whose observed kind in `param_kinds` is guardable,
/// followed by `proto`'s original body untouched. `param_kinds` must
/// have one entry per parameter register (`proto.arity` entries,
/// ordered to match the parameter registers starting at
/// `GLOBAL_BAND_SIZE`); a kind with no guard is simply skipped, since
/// there is nothing further to check before running the baseline body.
pub fn build_specialized_chunk(proto: &FunctionProto, param_kinds: &[ValueKind]) -> OrusResult<Chunk> {
    let mut b = ChunkBuilder::new();
    for (i, kind) in param_kinds.iter().enumerate() {
        if let Some(op) = guard_opcode(*kind) {
            let reg = RegisterId::new(GLOBAL_BAND_SIZE + i as u16);
            b.emit(op, &[Operand::Reg(reg)], SourceLocation::SYNTHETIC);
        }
    }
    b.append_chunk(&proto.chunk)?;
    Ok(b.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Constant;
    use crate::error::SourceLocation;

    fn proto_returning_const(value: Constant) -> FunctionProto {
        let mut b = ChunkBuilder::new();
        let idx = b.add_constant(value).unwrap();
        let dst = RegisterId::new(GLOBAL_BAND_SIZE + 2);
        b.emit(Opcode::LoadConst, &[Operand::Reg(dst), Operand::U16(idx)], SourceLocation::SYNTHETIC);
        b.emit(Opcode::Return, &[Operand::Reg(dst)], SourceLocation::SYNTHETIC);
        FunctionProto {
            name: "f".into(),
            arity: 2,
            register_count: 8,
            temp_count: 0,
            chunk: b.finish(),
        }
    }

    #[test]
    fn guard_opcode_covers_the_five_numeric_kinds_only() {
        assert_eq!(guard_opcode(ValueKind::I32), Some(Opcode::GuardI32));
        assert_eq!(guard_opcode(ValueKind::F64), Some(Opcode::GuardF64));
        assert_eq!(guard_opcode(ValueKind::Bool), None);
        assert_eq!(guard_opcode(ValueKind::String), None);
    }

    #[test]
    fn specialized_chunk_prefixes_a_guard_per_numeric_parameter() {
        let proto = proto_returning_const(Constant::I32(7));
        let chunk = build_specialized_chunk(&proto, &[ValueKind::I32, ValueKind::F64]).unwrap();

        assert_eq!(chunk.op_at(0).unwrap(), Opcode::GuardI32);
        let guard0_len = 1 + Opcode::GuardI32.operand_len();
        assert_eq!(chunk.op_at(guard0_len).unwrap(), Opcode::GuardF64);
        let guard1_len = 1 + Opcode::GuardF64.operand_len();
        let body_start = guard0_len + guard1_len;
        assert_eq!(chunk.op_at(body_start).unwrap(), Opcode::LoadConst);
    }

    #[test]
    fn a_non_numeric_parameter_kind_emits_no_guard() {
        let proto = proto_returning_const(Constant::I32(7));
        let chunk = build_specialized_chunk(&proto, &[ValueKind::String, ValueKind::Bool]).unwrap();
        assert_eq!(chunk.op_at(0).unwrap(), Opcode::LoadConst);
    }
}
