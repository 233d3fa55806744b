//! `INC_CMP_JMP`'s counter increment is checked, not wrapping, for the
//! signed kinds: a counter already at `i32::MAX` raises a genuine
//! overflow error rather than wrapping past the limit comparison or
//! silently looping forever.

use orus_vm::chunk::{ChunkBuilder, Constant, Opcode, Operand};
use orus_vm::config::VmConfigBuilder;
use orus_vm::error::SourceLocation;
use orus_vm::register::{RegisterId, GLOBAL_BAND_SIZE};
use orus_vm::value::Value;
use orus_vm::{FunctionProto, InterpretResult, Vm};

fn local(n: u16) -> RegisterId {
    RegisterId::new(GLOBAL_BAND_SIZE + n)
}

#[test]
fn counter_at_i32_max_overflows_instead_of_wrapping() {
    let counter = local(0);
    let limit = local(1);

    let mut b = ChunkBuilder::new();
    let max = b.add_constant(Constant::I32(i32::MAX)).unwrap();

    b.emit(Opcode::LoadI32Const, &[Operand::Reg(counter), Operand::U16(max)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::LoadI32Const, &[Operand::Reg(limit), Operand::U16(max)], SourceLocation::SYNTHETIC);
    b.emit(
        Opcode::IncCmpJmp,
        &[Operand::Reg(counter), Operand::Reg(limit), Operand::I16(0)],
        SourceLocation::SYNTHETIC,
    );
    b.emit(Opcode::Halt, &[], SourceLocation::SYNTHETIC);

    let chunk = b.finish();
    let proto = FunctionProto {
        name: "overflow".into(),
        arity: 0,
        register_count: 8,
        temp_count: 0,
        chunk,
    };
    let mut vm = Vm::new(vec![proto], vec![], VmConfigBuilder::new().build());

    assert_eq!(vm.run(0), InterpretResult::RuntimeError);
    assert!(matches!(vm.last_error(), Some(Value::Error(_))));
}

#[test]
fn u32_counter_wraps_instead_of_overflowing() {
    let counter = local(0);
    let limit = local(1);

    let mut b = ChunkBuilder::new();
    let max = b.add_constant(Constant::U32(u32::MAX)).unwrap();
    // Comparison is `<`, so a limit below the wrapped value exits the
    // loop on the very first pass rather than looping forever.
    let zero = b.add_constant(Constant::U32(0)).unwrap();

    b.emit(Opcode::LoadU32Const, &[Operand::Reg(counter), Operand::U16(max)], SourceLocation::SYNTHETIC);
    b.emit(Opcode::LoadU32Const, &[Operand::Reg(limit), Operand::U16(zero)], SourceLocation::SYNTHETIC);
    b.emit(
        Opcode::IncCmpJmp,
        &[Operand::Reg(counter), Operand::Reg(limit), Operand::I16(0)],
        SourceLocation::SYNTHETIC,
    );
    b.emit(Opcode::Halt, &[], SourceLocation::SYNTHETIC);

    let chunk = b.finish();
    let proto = FunctionProto {
        name: "wrap".into(),
        arity: 0,
        register_count: 8,
        temp_count: 0,
        chunk,
    };
    let mut vm = Vm::new(vec![proto], vec![], VmConfigBuilder::new().build());

    assert_eq!(vm.run(0), InterpretResult::Ok);
}
