//! Property: a bare `IncCmpJmp` loop (no body between back-edges)
//! always finishes with its counter exactly at its limit, for any
//! starting point and any number of passes, whether or not the run
//! happens to tier up partway through.

use orus_vm::chunk::{ChunkBuilder, Constant, Opcode, Operand};
use orus_vm::config::VmConfigBuilder;
use orus_vm::error::SourceLocation;
use orus_vm::register::{RegisterId, GLOBAL_BAND_SIZE};
use orus_vm::{FunctionProto, InterpretResult, Vm};
use quickcheck_macros::quickcheck;

fn local(n: u16) -> RegisterId {
    RegisterId::new(GLOBAL_BAND_SIZE + n)
}

fn counting_loop_reaches_its_limit(start: i32, len: i32) -> bool {
    let counter = local(0);
    let limit = local(1);

    let mut b = ChunkBuilder::new();
    let c_start = b.add_constant(Constant::I32(start)).unwrap();
    let c_limit = b.add_constant(Constant::I32(start + len)).unwrap();
    b.emit(Opcode::LoadI32Const, &[Operand::Reg(counter), Operand::U16(c_start)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::LoadI32Const, &[Operand::Reg(limit), Operand::U16(c_limit)], SourceLocation::SYNTHETIC);

    let loop_start = b.offset();
    let fused_off = b.emit(
        Opcode::IncCmpJmp,
        &[Operand::Reg(counter), Operand::Reg(limit), Operand::I16(0)],
        SourceLocation::SYNTHETIC,
    );
    let after_fused = b.offset();
    b.patch_i16(fused_off + 5, (loop_start as i64 - after_fused as i64) as i16);

    b.emit(Opcode::AssertEq, &[Operand::Reg(counter), Operand::Reg(limit)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::Halt, &[], SourceLocation::SYNTHETIC);

    let chunk = b.finish();
    let proto = FunctionProto {
        name: "counting_loop".into(),
        arity: 0,
        register_count: 8,
        temp_count: 0,
        chunk,
    };
    // A low, fixed threshold means some instances of this property
    // tier up partway through and some don't, depending on `len` --
    // the invariant must hold either way.
    let config = VmConfigBuilder::new().hot_threshold(3).build();
    let mut vm = Vm::new(vec![proto], vec![], config);
    vm.run(0) == InterpretResult::Ok
}

#[quickcheck]
fn fused_i32_loop_always_finishes_with_counter_at_limit(start: i16, len: u8) -> bool {
    let start = i32::from(start % 1000);
    // The fused instruction always executes at least once before its
    // first compare, so `len == 0` (limit equal to the start value)
    // would exit one pass past the limit; restrict to >= 1 pass.
    let len = i32::from(len % 30) + 1;
    counting_loop_reaches_its_limit(start, len)
}

fn counting_down_loop_reaches_its_limit(start: i32, len: i32) -> bool {
    let counter = local(0);
    let limit = local(1);

    let mut b = ChunkBuilder::new();
    let c_start = b.add_constant(Constant::I32(start)).unwrap();
    let c_limit = b.add_constant(Constant::I32(start - len)).unwrap();
    b.emit(Opcode::LoadI32Const, &[Operand::Reg(counter), Operand::U16(c_start)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::LoadI32Const, &[Operand::Reg(limit), Operand::U16(c_limit)], SourceLocation::SYNTHETIC);

    let loop_start = b.offset();
    let fused_off = b.emit(
        Opcode::DecCmpJmp,
        &[Operand::Reg(counter), Operand::Reg(limit), Operand::I16(0)],
        SourceLocation::SYNTHETIC,
    );
    let after_fused = b.offset();
    b.patch_i16(fused_off + 5, (loop_start as i64 - after_fused as i64) as i16);

    b.emit(Opcode::AssertEq, &[Operand::Reg(counter), Operand::Reg(limit)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::Halt, &[], SourceLocation::SYNTHETIC);

    let chunk = b.finish();
    let proto = FunctionProto {
        name: "counting_down_loop".into(),
        arity: 0,
        register_count: 8,
        temp_count: 0,
        chunk,
    };
    let config = VmConfigBuilder::new().hot_threshold(3).build();
    let mut vm = Vm::new(vec![proto], vec![], config);
    vm.run(0) == InterpretResult::Ok
}

#[quickcheck]
fn fused_i32_countdown_loop_always_finishes_with_counter_at_limit(start: i16, len: u8) -> bool {
    let start = i32::from(start % 1000);
    let len = i32::from(len % 30) + 1;
    counting_down_loop_reaches_its_limit(start, len)
}
