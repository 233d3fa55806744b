//! Local, byte-level simplifications over an emitted [`Chunk`], run
//! once before the chunk is handed to the dispatcher.
//!
//! Three rewrite classes, applied to a fixed point:
//! - Redundant loads: a load into register `r` is deleted when `r`
//!   already holds the same value, tracing back through a chain of
//!   plain register-to-register moves (so `LOAD c,r; MOVE r2,r; LOAD
//!   c,r2` collapses the second load, since the move already put `c`
//!   into `r2`).
//! - Load/move fusion: a load immediately followed by a move that
//!   promotes the loaded value into the global band is rewritten to
//!   load directly into the global register, dropping the move.
//! - Redundant moves: `MOVE r, r` is deleted outright.
//!
//! Every deletion removes the corresponding source-map entries and
//! shifts the ones after it, so source locations stay attributed to
//! the right bytes. This pass does not renumber jump targets; it must
//! only run on straight-line sequences that contain no jump whose
//! target falls inside a rewritten span.

use crate::chunk::{Chunk, Opcode};
use crate::register::RegisterId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeepholeStats {
    pub redundant_loads_collapsed: u32,
    pub load_move_fusions: u32,
    pub redundant_moves_deleted: u32,
}

pub fn run(chunk: &mut Chunk) -> PeepholeStats {
    let mut stats = PeepholeStats::default();
    loop {
        if try_redundant_move(chunk, &mut stats) {
            continue;
        }
        if try_redundant_load(chunk, &mut stats) {
            continue;
        }
        if try_load_move_fusion(chunk, &mut stats) {
            continue;
        }
        break;
    }
    stats
}

fn is_load_op(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::LoadNil
            | Opcode::LoadTrue
            | Opcode::LoadFalse
            | Opcode::LoadConst
            | Opcode::LoadI32Const
            | Opcode::LoadI64Const
            | Opcode::LoadU32Const
            | Opcode::LoadU64Const
            | Opcode::LoadF64Const
    )
}

fn load_const_idx(chunk: &Chunk, offset: usize, op: Opcode) -> Option<u16> {
    match op {
        Opcode::LoadNil | Opcode::LoadTrue | Opcode::LoadFalse => None,
        Opcode::LoadConst
        | Opcode::LoadI32Const
        | Opcode::LoadI64Const
        | Opcode::LoadU32Const
        | Opcode::LoadU64Const
        | Opcode::LoadF64Const => Some(chunk.read_u16(offset + 3)),
        _ => None,
    }
}

fn load_dst(chunk: &Chunk, offset: usize) -> RegisterId {
    chunk.read_register(offset + 1)
}

fn scan(chunk: &Chunk) -> Vec<(usize, Opcode)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < chunk.len() {
        let op = chunk.op_at(offset).expect("peephole scan: malformed chunk");
        out.push((offset, op));
        offset += chunk.instruction_len(offset).expect("peephole scan: malformed chunk");
    }
    out
}

fn delete_instruction(chunk: &mut Chunk, offset: usize, len: usize) {
    chunk.code_mut().drain(offset..offset + len);
    chunk.source_map_mut().delete_range(offset..offset + len);
}

fn try_redundant_move(chunk: &mut Chunk, stats: &mut PeepholeStats) -> bool {
    for (offset, op) in scan(chunk) {
        if op != Opcode::Move {
            continue;
        }
        let dst = chunk.read_register(offset + 1);
        let src = chunk.read_register(offset + 3);
        if dst == src {
            delete_instruction(chunk, offset, 1 + op.operand_len());
            stats.redundant_moves_deleted += 1;
            return true;
        }
    }
    false
}

fn try_redundant_load(chunk: &mut Chunk, stats: &mut PeepholeStats) -> bool {
    let instrs = scan(chunk);
    for (i, &(offset, op)) in instrs.iter().enumerate() {
        if !is_load_op(op) {
            continue;
        }
        let dst = load_dst(chunk, offset);
        let const_idx = load_const_idx(chunk, offset, op);

        let mut current = dst;
        let mut j = i;
        while j > 0 {
            let (prev_off, prev_op) = instrs[j - 1];
            if prev_op == Opcode::Move {
                let mdst = chunk.read_register(prev_off + 1);
                let msrc = chunk.read_register(prev_off + 3);
                if mdst == current {
                    current = msrc;
                    j -= 1;
                    continue;
                }
            }
            break;
        }
        if j == 0 {
            continue;
        }
        let (prev_off, prev_op) = instrs[j - 1];
        if prev_op != op {
            continue;
        }
        let prev_dst = load_dst(chunk, prev_off);
        let prev_const = load_const_idx(chunk, prev_off, prev_op);
        if prev_dst == current && prev_const == const_idx {
            delete_instruction(chunk, offset, 1 + op.operand_len());
            stats.redundant_loads_collapsed += 1;
            return true;
        }
    }
    false
}

fn try_load_move_fusion(chunk: &mut Chunk, stats: &mut PeepholeStats) -> bool {
    let instrs = scan(chunk);
    for i in 0..instrs.len().saturating_sub(1) {
        let (off1, op1) = instrs[i];
        let (off2, op2) = instrs[i + 1];
        if !is_load_op(op1) || op2 != Opcode::Move {
            continue;
        }
        let loaded = load_dst(chunk, off1);
        let move_dst = chunk.read_register(off2 + 1);
        let move_src = chunk.read_register(off2 + 3);
        if move_src != loaded || !(move_dst.is_global() && !move_src.is_global()) {
            continue;
        }
        let bytes = move_dst.raw().to_be_bytes();
        chunk.code_mut()[off1 + 1] = bytes[0];
        chunk.code_mut()[off1 + 2] = bytes[1];
        delete_instruction(chunk, off2, 1 + op2.operand_len());
        stats.load_move_fusions += 1;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkBuilder, Constant, Operand};
    use crate::error::SourceLocation;
    use crate::register::GLOBAL_BAND_SIZE;

    fn local(n: u16) -> RegisterId {
        RegisterId::new(GLOBAL_BAND_SIZE + n)
    }

    fn global(n: u16) -> RegisterId {
        RegisterId::new(n)
    }

    #[test]
    fn consecutive_identical_bool_loads_collapse() {
        let mut b = ChunkBuilder::new();
        b.emit(Opcode::LoadTrue, &[Operand::Reg(local(0))], SourceLocation::SYNTHETIC);
        b.emit(Opcode::LoadTrue, &[Operand::Reg(local(0))], SourceLocation::SYNTHETIC);
        let mut chunk = b.finish();
        let stats = run(&mut chunk);
        assert_eq!(stats.redundant_loads_collapsed, 1);
        assert_eq!(chunk.len(), 1 + Opcode::LoadTrue.operand_len());
    }

    #[test]
    fn reload_of_a_value_already_moved_into_place_is_dropped() {
        let mut b = ChunkBuilder::new();
        let c = b.add_constant(Constant::I32(9)).unwrap();
        b.emit(
            Opcode::LoadI32Const,
            &[Operand::Reg(local(0)), Operand::U16(c)],
            SourceLocation::SYNTHETIC,
        );
        b.emit(
            Opcode::Move,
            &[Operand::Reg(local(1)), Operand::Reg(local(0))],
            SourceLocation::SYNTHETIC,
        );
        b.emit(
            Opcode::LoadI32Const,
            &[Operand::Reg(local(1)), Operand::U16(c)],
            SourceLocation::SYNTHETIC,
        );
        let mut chunk = b.finish();
        let stats = run(&mut chunk);
        assert_eq!(stats.redundant_loads_collapsed, 1);
        // Exactly the load and the move survive.
        assert_eq!(chunk.len(), Opcode::LoadI32Const.operand_len() + 1 + Opcode::Move.operand_len() + 1);
    }

    #[test]
    fn move_into_global_band_fuses_into_the_preceding_load() {
        let mut b = ChunkBuilder::new();
        let c = b.add_constant(Constant::I32(3)).unwrap();
        b.emit(
            Opcode::LoadI32Const,
            &[Operand::Reg(local(0)), Operand::U16(c)],
            SourceLocation::SYNTHETIC,
        );
        b.emit(
            Opcode::Move,
            &[Operand::Reg(global(2)), Operand::Reg(local(0))],
            SourceLocation::SYNTHETIC,
        );
        let mut chunk = b.finish();
        let stats = run(&mut chunk);
        assert_eq!(stats.load_move_fusions, 1);
        assert_eq!(chunk.len(), 1 + Opcode::LoadI32Const.operand_len());
        assert_eq!(chunk.read_register(1), global(2));
    }

    #[test]
    fn self_move_is_deleted() {
        let mut b = ChunkBuilder::new();
        b.emit(
            Opcode::Move,
            &[Operand::Reg(local(0)), Operand::Reg(local(0))],
            SourceLocation::SYNTHETIC,
        );
        let mut chunk = b.finish();
        let stats = run(&mut chunk);
        assert_eq!(stats.redundant_moves_deleted, 1);
        assert!(chunk.is_empty());
    }

    #[test]
    fn source_map_stays_coherent_after_a_deletion() {
        let mut b = ChunkBuilder::new();
        b.emit(Opcode::LoadTrue, &[Operand::Reg(local(0))], SourceLocation { file: None, line: 1, column: 1 });
        b.emit(Opcode::LoadTrue, &[Operand::Reg(local(0))], SourceLocation { file: None, line: 2, column: 1 });
        b.emit(Opcode::Print, &[Operand::Reg(local(0))], SourceLocation { file: None, line: 3, column: 1 });
        let mut chunk = b.finish();
        run(&mut chunk);
        // The surviving PRINT instruction still maps to line 3.
        let print_offset = chunk.len() - (1 + Opcode::Print.operand_len());
        assert_eq!(chunk.source_location(print_offset).line, 3);
    }

    // Generalizes `consecutive_identical_bool_loads_collapse`: any run
    // of identical `LOAD_TRUE r` instructions, however long, collapses
    // to exactly one, and a second pass over the result is a no-op.
    #[quickcheck_macros::quickcheck]
    fn any_run_of_identical_loads_collapses_to_one(repeats: u8) -> bool {
        let repeats = (repeats % 20) + 1;
        let mut b = ChunkBuilder::new();
        for _ in 0..repeats {
            b.emit(Opcode::LoadTrue, &[Operand::Reg(local(0))], SourceLocation::SYNTHETIC);
        }
        let mut chunk = b.finish();
        run(&mut chunk);
        if chunk.len() != 1 + Opcode::LoadTrue.operand_len() {
            return false;
        }
        run(&mut chunk) == PeepholeStats::default()
    }
}
