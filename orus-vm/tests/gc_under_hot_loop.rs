//! A fused loop that reassigns a string register every pass, run with
//! `gc_threshold(0)` so every back-edge's safepoint forces a
//! collection. The accumulator must survive every sweep since it stays
//! live in the frame's register file, while the strings it replaces
//! each pass are left to be collected.

use orus_vm::chunk::{ChunkBuilder, Constant, Opcode, Operand};
use orus_vm::config::VmConfigBuilder;
use orus_vm::error::SourceLocation;
use orus_vm::register::{RegisterId, GLOBAL_BAND_SIZE};
use orus_vm::{FunctionProto, InterpretResult, Vm};

fn local(n: u16) -> RegisterId {
    RegisterId::new(GLOBAL_BAND_SIZE + n)
}

#[test]
fn accumulator_string_survives_gc_triggered_mid_loop() {
    let counter = local(0);
    let limit = local(1);
    let acc = local(2);
    let step = local(3);
    let expected = local(4);

    let mut b = ChunkBuilder::new();
    let c0 = b.add_constant(Constant::I32(0)).unwrap();
    let c3 = b.add_constant(Constant::I32(3)).unwrap();
    let empty = b.add_constant(Constant::Str(String::new())).unwrap();
    let x = b.add_constant(Constant::Str("x".into())).unwrap();
    let xxx = b.add_constant(Constant::Str("xxx".into())).unwrap();

    b.emit(Opcode::LoadI32Const, &[Operand::Reg(counter), Operand::U16(c0)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::LoadI32Const, &[Operand::Reg(limit), Operand::U16(c3)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::LoadConst, &[Operand::Reg(acc), Operand::U16(empty)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::LoadConst, &[Operand::Reg(step), Operand::U16(x)], SourceLocation::SYNTHETIC);

    let loop_start = b.offset();
    b.emit(
        Opcode::Concat,
        &[Operand::Reg(acc), Operand::Reg(acc), Operand::Reg(step)],
        SourceLocation::SYNTHETIC,
    );
    let fused_off = b.emit(
        Opcode::IncCmpJmp,
        &[Operand::Reg(counter), Operand::Reg(limit), Operand::I16(0)],
        SourceLocation::SYNTHETIC,
    );
    let after_fused = b.offset();
    b.patch_i16(fused_off + 5, (loop_start as i64 - after_fused as i64) as i16);

    b.emit(Opcode::LoadConst, &[Operand::Reg(expected), Operand::U16(xxx)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::AssertEq, &[Operand::Reg(acc), Operand::Reg(expected)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::Halt, &[], SourceLocation::SYNTHETIC);

    let chunk = b.finish();
    let proto = FunctionProto {
        name: "gc_loop".into(),
        arity: 0,
        register_count: 8,
        temp_count: 0,
        chunk,
    };
    // Never tiers up (the loop only runs three passes); the point of
    // this test is the GC safepoint at each taken back-edge, not the
    // JIT.
    let config = VmConfigBuilder::new().hot_threshold(100).gc_threshold(0).build();
    let mut vm = Vm::new(vec![proto], vec![], config);

    assert_eq!(vm.run(0), InterpretResult::Ok);
}
