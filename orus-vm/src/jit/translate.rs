//! Lifts a bytecode linear block rooted at a loop header into
//! [`Program`]. The block is assumed straight-line: any branch other
//! than the terminating fused loop instruction bails translation, on
//! the premise that only the canonical counted-loop shape is worth
//! tracing at this tier.

use std::collections::HashMap;

use crate::chunk::{Chunk, Constant, Opcode};
use crate::dispatch::Vm;
use crate::jit::ir::{ArithOp, CmpOp, IrNode, IrOp, Program};
use crate::jit::rollout::RolloutStage;
use crate::register::RegisterId;
use crate::value::ValueKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum TranslateStatus {
    /// The current rollout stage doesn't cover a kind this block touches.
    RolloutDisabled,
    /// A constant-pool entry's tag didn't match the load opcode's kind.
    UnsupportedConstantKind,
    /// An opcode this translator doesn't lift (calls, nested branches,
    /// in-place inc/dec, ...).
    UnsupportedOpcode,
    /// Walked off the end of the chunk without finding the fused
    /// instruction that closes the loop.
    MissingBackEdge,
    /// The fused loop's counter register isn't currently typed-live,
    /// so there's no observed kind to specialize on.
    UnresolvedCounterKind,
}

pub fn translate_linear_block(vm: &Vm, func: usize, loop_offset: usize) -> Result<Program, TranslateStatus> {
    let chunk = vm.function_chunk(func);
    let stage = vm.rollout_stage();
    let mut nodes = Vec::new();
    let mut offset = loop_offset;

    loop {
        if offset >= chunk.len() {
            return Err(TranslateStatus::MissingBackEdge);
        }
        let op = chunk.op_at(offset).map_err(|_| TranslateStatus::UnsupportedOpcode)?;
        let len = chunk.instruction_len(offset).map_err(|_| TranslateStatus::UnsupportedOpcode)?;

        if matches!(op, Opcode::IncCmpJmp | Opcode::DecCmpJmp) {
            let counter = chunk.read_register(offset + 1);
            let limit = chunk.read_register(offset + 3);
            let rel = chunk.read_i16(offset + 5);
            let kind = vm
                .register_kind(counter)
                .ok_or(TranslateStatus::UnresolvedCounterKind)?;
            if !matches!(kind, ValueKind::I32 | ValueKind::I64 | ValueKind::U32 | ValueKind::U64) {
                return Err(TranslateStatus::UnsupportedOpcode);
            }
            if !stage.allows(kind) {
                return Err(TranslateStatus::RolloutDisabled);
            }
            nodes.push(IrNode {
                op: IrOp::LoopBack {
                    counter,
                    limit,
                    kind,
                    increment: matches!(op, Opcode::IncCmpJmp),
                    offset: rel,
                },
                bytecode_offset: offset,
                bytecode_length: len,
            });
            break;
        }

        let node = translate_one(chunk, offset, len, op, stage)?;
        let terminal = matches!(node.op, IrOp::Return { .. });
        nodes.push(node);
        if terminal {
            break;
        }
        offset += len;
    }

    promote_widened_loads(&mut nodes);
    Ok(Program { func, loop_offset, nodes })
}

fn translate_one(chunk: &Chunk, offset: usize, len: usize, op: Opcode, stage: RolloutStage) -> Result<IrNode, TranslateStatus> {
    use Opcode::*;

    let wrap = |irop: IrOp| IrNode { op: irop, bytecode_offset: offset, bytecode_length: len };

    let typed_load = |kind: ValueKind| -> Result<IrOp, TranslateStatus> {
        if !stage.allows(kind) {
            return Err(TranslateStatus::RolloutDisabled);
        }
        let dst = chunk.read_register(offset + 1);
        let idx = chunk.read_u16(offset + 3);
        let constant = chunk.constant(idx).map_err(|_| TranslateStatus::UnsupportedConstantKind)?;
        let bits = constant_bits(constant, kind).ok_or(TranslateStatus::UnsupportedConstantKind)?;
        Ok(IrOp::LoadConst { dst, kind, bits })
    };

    let arith3 = |kind: ValueKind, arith: ArithOp, helper_only: bool| -> Result<IrOp, TranslateStatus> {
        if !stage.allows(kind) {
            return Err(TranslateStatus::RolloutDisabled);
        }
        let dst = chunk.read_register(offset + 1);
        let a = chunk.read_register(offset + 3);
        let b = chunk.read_register(offset + 5);
        Ok(if helper_only {
            IrOp::HelperArith { op: arith, kind, dst, a, b }
        } else {
            IrOp::Arith { op: arith, kind, dst, a, b }
        })
    };

    let cmp3 = |kind: ValueKind, cmp: CmpOp| -> Result<IrOp, TranslateStatus> {
        if !stage.allows(kind) {
            return Err(TranslateStatus::RolloutDisabled);
        }
        let dst = chunk.read_register(offset + 1);
        let a = chunk.read_register(offset + 3);
        let b = chunk.read_register(offset + 5);
        Ok(IrOp::Cmp { op: cmp, kind, dst, a, b })
    };

    let irop = match op {
        LoadI32Const => typed_load(ValueKind::I32)?,
        LoadI64Const => typed_load(ValueKind::I64)?,
        LoadU32Const => typed_load(ValueKind::U32)?,
        LoadU64Const => typed_load(ValueKind::U64)?,
        LoadF64Const => typed_load(ValueKind::F64)?,

        Move => IrOp::Move {
            dst: chunk.read_register(offset + 1),
            src: chunk.read_register(offset + 3),
        },

        AddI32Typed => arith3(ValueKind::I32, ArithOp::Add, false)?,
        SubI32Typed => arith3(ValueKind::I32, ArithOp::Sub, false)?,
        MulI32Typed => arith3(ValueKind::I32, ArithOp::Mul, false)?,
        DivI32Typed => arith3(ValueKind::I32, ArithOp::Div, false)?,
        ModI32Typed => arith3(ValueKind::I32, ArithOp::Mod, false)?,
        AddI64Typed => arith3(ValueKind::I64, ArithOp::Add, false)?,
        SubI64Typed => arith3(ValueKind::I64, ArithOp::Sub, false)?,
        MulI64Typed => arith3(ValueKind::I64, ArithOp::Mul, false)?,
        DivI64Typed => arith3(ValueKind::I64, ArithOp::Div, true)?,
        ModI64Typed => arith3(ValueKind::I64, ArithOp::Mod, true)?,
        AddU32Typed => arith3(ValueKind::U32, ArithOp::Add, false)?,
        SubU32Typed => arith3(ValueKind::U32, ArithOp::Sub, false)?,
        MulU32Typed => arith3(ValueKind::U32, ArithOp::Mul, false)?,
        DivU32Typed => arith3(ValueKind::U32, ArithOp::Div, false)?,
        ModU32Typed => arith3(ValueKind::U32, ArithOp::Mod, false)?,
        AddU64Typed => arith3(ValueKind::U64, ArithOp::Add, false)?,
        SubU64Typed => arith3(ValueKind::U64, ArithOp::Sub, false)?,
        MulU64Typed => arith3(ValueKind::U64, ArithOp::Mul, false)?,
        DivU64Typed => arith3(ValueKind::U64, ArithOp::Div, true)?,
        ModU64Typed => arith3(ValueKind::U64, ArithOp::Mod, true)?,
        AddF64Typed => arith3(ValueKind::F64, ArithOp::Add, false)?,
        SubF64Typed => arith3(ValueKind::F64, ArithOp::Sub, false)?,
        MulF64Typed => arith3(ValueKind::F64, ArithOp::Mul, false)?,
        DivF64Typed => arith3(ValueKind::F64, ArithOp::Div, true)?,
        ModF64Typed => arith3(ValueKind::F64, ArithOp::Mod, true)?,

        LtI32Typed => cmp3(ValueKind::I32, CmpOp::Lt)?,
        LtI64Typed => cmp3(ValueKind::I64, CmpOp::Lt)?,
        LtU32Typed => cmp3(ValueKind::U32, CmpOp::Lt)?,
        LtU64Typed => cmp3(ValueKind::U64, CmpOp::Lt)?,
        LtF64Typed => cmp3(ValueKind::F64, CmpOp::Lt)?,
        EqI32Typed => cmp3(ValueKind::I32, CmpOp::Eq)?,
        EqI64Typed => cmp3(ValueKind::I64, CmpOp::Eq)?,
        EqU32Typed => cmp3(ValueKind::U32, CmpOp::Eq)?,
        EqU64Typed => cmp3(ValueKind::U64, CmpOp::Eq)?,
        EqF64Typed => cmp3(ValueKind::F64, CmpOp::Eq)?,

        Concat => {
            if !stage.allows(ValueKind::String) {
                return Err(TranslateStatus::RolloutDisabled);
            }
            IrOp::Concat {
                dst: chunk.read_register(offset + 1),
                a: chunk.read_register(offset + 3),
                b: chunk.read_register(offset + 5),
            }
        }
        GetIter => IrOp::GetIter {
            dst: chunk.read_register(offset + 1),
            src: chunk.read_register(offset + 3),
        },
        IterNext => IrOp::IterNext {
            iter: chunk.read_register(offset + 1),
            dst: chunk.read_register(offset + 3),
            has_value: chunk.read_register(offset + 5),
        },
        Print => IrOp::Print { src: chunk.read_register(offset + 1) },
        AssertEq => IrOp::AssertEq {
            a: chunk.read_register(offset + 1),
            b: chunk.read_register(offset + 3),
        },
        MakeArray => IrOp::MakeArray {
            dst: chunk.read_register(offset + 1),
            arg_base: chunk.read_register(offset + 3),
            arg_count: chunk.read_u16(offset + 5),
        },
        ArrayPush => IrOp::ArrayPush {
            array: chunk.read_register(offset + 1),
            value: chunk.read_register(offset + 3),
        },
        CallNative => IrOp::CallNative {
            dst: chunk.read_register(offset + 1),
            native_id: chunk.read_u16(offset + 3),
            spill_base: chunk.read_register(offset + 5),
            spill_count: chunk.read_u8(offset + 7),
        },
        Return => IrOp::Return { src: Some(chunk.read_register(offset + 1)) },
        ReturnVoid => IrOp::Return { src: None },

        _ => return Err(TranslateStatus::UnsupportedOpcode),
    };

    Ok(wrap(irop))
}

fn constant_bits(constant: &Constant, kind: ValueKind) -> Option<u64> {
    match (constant, kind) {
        (Constant::I32(v), ValueKind::I32) => Some(*v as i64 as u64),
        (Constant::I64(v), ValueKind::I64) => Some(*v as u64),
        (Constant::U32(v), ValueKind::U32) => Some(*v as u64),
        (Constant::U64(v), ValueKind::U64) => Some(*v),
        (Constant::F64(v), ValueKind::F64) => Some(v.to_bits()),
        _ => None,
    }
}

/// Rewrite an `I32`/`U32` constant load's kind tag to the wider kind an
/// arithmetic op immediately consuming it expects, e.g. `LOAD_I32_CONST
/// r1, #1; ADD_I64_TYPED r2, r1, r0` becomes a direct `I64` load: our
/// bit encoding already sign/zero-extends at load time, so widening is
/// a kind-tag rewrite with no bit pattern change.
fn promote_widened_loads(nodes: &mut [IrNode]) {
    let mut last_load: HashMap<RegisterId, usize> = HashMap::new();
    for i in 0..nodes.len() {
        match nodes[i].op {
            IrOp::LoadConst { dst, .. } => {
                last_load.insert(dst, i);
            }
            IrOp::Arith { kind, a, b, .. } | IrOp::HelperArith { kind, a, b, .. } => {
                for r in [a, b] {
                    widen_if_needed(nodes, &last_load, r, kind);
                }
            }
            _ => {}
        }
    }
}

fn widen_if_needed(nodes: &mut [IrNode], last_load: &HashMap<RegisterId, usize>, reg: RegisterId, wider: ValueKind) {
    let Some(&idx) = last_load.get(&reg) else { return };
    if let IrOp::LoadConst { dst, kind, bits } = nodes[idx].op {
        if kind != wider && kind.widens_to(wider) {
            nodes[idx].op = IrOp::LoadConst { dst, kind: wider, bits };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkBuilder, Operand};
    use crate::config::VmConfigBuilder;
    use crate::dispatch::FunctionProto;
    use crate::error::SourceLocation;
    use crate::register::GLOBAL_BAND_SIZE;

    fn local(n: u16) -> RegisterId {
        RegisterId::new(GLOBAL_BAND_SIZE + n)
    }

    #[test]
    fn straight_line_int_loop_translates_to_loopback() {
        let mut b = ChunkBuilder::new();
        let c1 = b.add_constant(Constant::I32(1)).unwrap();
        let loop_start = b.emit(
            Opcode::AddI32Typed,
            &[Operand::Reg(local(0)), Operand::Reg(local(0)), Operand::Reg(local(1))],
            SourceLocation::SYNTHETIC,
        );
        b.emit(
            Opcode::IncCmpJmp,
            &[Operand::Reg(local(2)), Operand::Reg(local(3)), Operand::I16(-(6_i16))],
            SourceLocation::SYNTHETIC,
        );
        b.emit(Opcode::Halt, &[], SourceLocation::SYNTHETIC);
        let chunk = b.finish();
        let proto = FunctionProto {
            name: "loop".into(),
            arity: 0,
            register_count: 8,
            temp_count: 0,
            chunk,
        };
        let mut vm = Vm::new(vec![proto], vec![], VmConfigBuilder::new().build());
        vm.run(0);
        // The counter register never actually ran in this synthetic
        // fixture, so no typed kind is observed: translation must bail
        // cleanly rather than panic.
        let result = translate_linear_block(&vm, 0, loop_start);
        assert_eq!(result.unwrap_err(), TranslateStatus::UnresolvedCounterKind);
        let _ = c1;
    }

    // For any I32 constant feeding an I64 add, the load's kind tag is
    // rewritten to I64 and its bit pattern is untouched, for any value
    // and any register pair, not just the one fixed example.
    #[quickcheck_macros::quickcheck]
    fn i32_load_feeding_an_i64_arith_widens_in_place(v: i32, dst: u16, other: u16) -> bool {
        let dst = local(dst % 8);
        let other = local((other % 8).max(1));
        let bits = v as i64 as u64;
        let mut nodes = vec![
            IrNode {
                op: IrOp::LoadConst { dst, kind: ValueKind::I32, bits },
                bytecode_offset: 0,
                bytecode_length: 4,
            },
            IrNode {
                op: IrOp::Arith { op: ArithOp::Add, kind: ValueKind::I64, dst: other, a: dst, b: other },
                bytecode_offset: 4,
                bytecode_length: 6,
            },
        ];
        promote_widened_loads(&mut nodes);
        matches!(nodes[0].op, IrOp::LoadConst { kind: ValueKind::I64, bits: b, .. } if b == bits)
    }

    // Same property for the unsigned pair: U32 widens to U64 without
    // touching the stored bits.
    #[quickcheck_macros::quickcheck]
    fn u32_load_feeding_a_u64_arith_widens_in_place(v: u32, dst: u16, other: u16) -> bool {
        let dst = local(dst % 8);
        let other = local((other % 8).max(1));
        let bits = v as u64;
        let mut nodes = vec![
            IrNode {
                op: IrOp::LoadConst { dst, kind: ValueKind::U32, bits },
                bytecode_offset: 0,
                bytecode_length: 4,
            },
            IrNode {
                op: IrOp::Arith { op: ArithOp::Add, kind: ValueKind::U64, dst: other, a: dst, b: other },
                bytecode_offset: 4,
                bytecode_length: 6,
            },
        ];
        promote_widened_loads(&mut nodes);
        matches!(nodes[0].op, IrOp::LoadConst { kind: ValueKind::U64, bits: b, .. } if b == bits)
    }
}
