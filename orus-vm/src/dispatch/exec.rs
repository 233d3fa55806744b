//! Per-instruction execution: the three opcode families and the
//! branch/call/return control-flow plumbing.

use super::{CallInfo, Vm};
use crate::chunk::Opcode;
use crate::error::{InterpretResult, OrusError, OrusResult, RuntimeError};
use crate::heap::{ObjArrayIterator, ObjRange, ObjRangeIterator};
use crate::jit::ir::{ArithOp, CmpOp, IrNode, IrOp, Program};
use crate::register::{RegisterId, GLOBAL_BAND_SIZE};
use crate::value::{TypedPayload, Value, ValueKind};

/// Read whichever representation of `id` is authoritative right now,
/// typed or boxed, as a numeric/bool payload.
fn read_numeric(vm: &mut Vm, id: RegisterId) -> Option<TypedPayload> {
    if let Some(kind) = vm.registers.typed_kind(id) {
        if let Some(p) = vm.registers.try_read_typed(id, kind) {
            return Some(p);
        }
    }
    vm.registers.get_register(id).as_typed()
}

macro_rules! typed_arith {
    ($vm:expr, $dst:expr, $a:expr, $b:expr, $offset:expr, $kind:ident, $checked:ident, $ctor:ident) => {{
        let a = match read_numeric($vm, $a) {
            Some(TypedPayload::$ctor(v)) => v,
            _ => return Ok(Some($vm.raise(RuntimeError::type_mismatch(stringify!($kind), $vm.current_location($offset))))),
        };
        let b = match read_numeric($vm, $b) {
            Some(TypedPayload::$ctor(v)) => v,
            _ => return Ok(Some($vm.raise(RuntimeError::type_mismatch(stringify!($kind), $vm.current_location($offset))))),
        };
        match a.$checked(b) {
            Some(r) => {
                $vm.registers.store_typed_hot($dst, TypedPayload::$ctor(r));
                Ok(None)
            }
            None => Ok(Some($vm.raise(RuntimeError::overflow($vm.current_location($offset))))),
        }
    }};
}

macro_rules! typed_wrapping_arith {
    ($vm:expr, $dst:expr, $a:expr, $b:expr, $offset:expr, $wrapping:ident, $ctor:ident) => {{
        let a = match read_numeric($vm, $a) {
            Some(TypedPayload::$ctor(v)) => v,
            _ => return Ok(Some($vm.raise(RuntimeError::type_mismatch(stringify!($ctor), $vm.current_location($offset))))),
        };
        let b = match read_numeric($vm, $b) {
            Some(TypedPayload::$ctor(v)) => v,
            _ => return Ok(Some($vm.raise(RuntimeError::type_mismatch(stringify!($ctor), $vm.current_location($offset))))),
        };
        let r = a.$wrapping(b);
        $vm.registers.store_typed_hot($dst, TypedPayload::$ctor(r));
        Ok(None)
    }};
}

macro_rules! typed_int_div {
    ($vm:expr, $dst:expr, $a:expr, $b:expr, $offset:expr, $ctor:ident, $checked:ident, $is_mod:expr) => {{
        let a = match read_numeric($vm, $a) {
            Some(TypedPayload::$ctor(v)) => v,
            _ => return Ok(Some($vm.raise(RuntimeError::type_mismatch(stringify!($ctor), $vm.current_location($offset))))),
        };
        let b = match read_numeric($vm, $b) {
            Some(TypedPayload::$ctor(v)) => v,
            _ => return Ok(Some($vm.raise(RuntimeError::type_mismatch(stringify!($ctor), $vm.current_location($offset))))),
        };
        if b == 0 {
            return Ok(Some($vm.raise(RuntimeError::div_by_zero($vm.current_location($offset)))));
        }
        match a.$checked(b) {
            Some(r) => {
                $vm.registers.store_typed_hot($dst, TypedPayload::$ctor(r));
                Ok(None)
            }
            None => Ok(Some($vm.raise(RuntimeError::overflow($vm.current_location($offset))))),
        }
    }};
}

macro_rules! typed_cmp {
    ($vm:expr, $dst:expr, $a:expr, $b:expr, $offset:expr, $ctor:ident, $op:tt) => {{
        let a = match read_numeric($vm, $a) {
            Some(TypedPayload::$ctor(v)) => v,
            _ => return Ok(Some($vm.raise(RuntimeError::type_mismatch(stringify!($ctor), $vm.current_location($offset))))),
        };
        let b = match read_numeric($vm, $b) {
            Some(TypedPayload::$ctor(v)) => v,
            _ => return Ok(Some($vm.raise(RuntimeError::type_mismatch(stringify!($ctor), $vm.current_location($offset))))),
        };
        $vm.registers.store_typed_hot($dst, TypedPayload::Bool(a $op b));
        Ok(None)
    }};
}

impl Vm {
    /// Execute exactly one instruction. `Ok(None)` means keep running;
    /// `Ok(Some(result))` means the dispatch loop should stop and
    /// return `result`.
    pub(super) fn step(&mut self) -> OrusResult<Option<InterpretResult>> {
        let offset = self.ip;
        let op = self.current_chunk().op_at(offset)?;
        let len = self.current_chunk().instruction_len(offset)?;
        self.ip = offset + len;

        use Opcode::*;
        match op {
            LoadConst => {
                let dst = self.reg_operand(offset, 1);
                let idx = self.u16_operand(offset, 3);
                let constant = self.current_chunk().constant(idx)?.clone();
                let value = self.materialize_constant(constant);
                self.registers.set_register(dst, value);
                Ok(None)
            }
            LoadNil => {
                let dst = self.reg_operand(offset, 1);
                self.registers.set_register(dst, Value::Nil);
                Ok(None)
            }
            LoadTrue => {
                let dst = self.reg_operand(offset, 1);
                self.registers.set_register(dst, Value::Bool(true));
                Ok(None)
            }
            LoadFalse => {
                let dst = self.reg_operand(offset, 1);
                self.registers.set_register(dst, Value::Bool(false));
                Ok(None)
            }
            Move => {
                let dst = self.reg_operand(offset, 1);
                let src = self.reg_operand(offset, 3);
                let v = self.registers.get_register(src);
                self.registers.set_register(dst, v);
                Ok(None)
            }
            Call => self.do_call(offset, false),
            CallNative => self.do_call_native(offset),
            TailCall => self.do_tail_call(offset),
            Return => {
                let src = self.reg_operand(offset, 1);
                let value = self.registers.get_register(src);
                Ok(Some(self.do_return(value)))
            }
            ReturnVoid => Ok(Some(self.do_return(Value::Nil))),
            Concat => {
                let dst = self.reg_operand(offset, 1);
                let a = self.reg_operand(offset, 3);
                let b = self.reg_operand(offset, 5);
                self.do_concat(dst, a, b, offset)
            }
            Jump => {
                let rel = self.i16_operand(offset, 1);
                self.ip = (self.ip as i64 + rel as i64) as usize;
                Ok(None)
            }
            JumpShort => {
                let rel = self.current_chunk().read_u8(offset + 1);
                self.ip += usize::from(rel);
                Ok(None)
            }
            JumpIfNot => {
                let pred = self.reg_operand(offset, 1);
                let rel = self.i16_operand(offset, 3);
                if !self.registers.get_register(pred).truthy() {
                    self.ip = (self.ip as i64 + rel as i64) as usize;
                }
                Ok(None)
            }
            JumpIfNotShort => {
                let pred = self.reg_operand(offset, 1);
                let rel = self.current_chunk().read_u8(offset + 3);
                if !self.registers.get_register(pred).truthy() {
                    self.ip += usize::from(rel);
                }
                Ok(None)
            }
            JumpIfNotBoolTyped => {
                let pred = self.reg_operand(offset, 1);
                let rel = self.i16_operand(offset, 3);
                let truthy = self
                    .registers
                    .try_read_typed(pred, ValueKind::Bool)
                    .map(|p| matches!(p, TypedPayload::Bool(true)))
                    .unwrap_or_else(|| self.registers.get_register(pred).truthy());
                if !truthy {
                    self.ip = (self.ip as i64 + rel as i64) as usize;
                }
                Ok(None)
            }
            MakeArray => {
                let dst = self.reg_operand(offset, 1);
                let arg_base = self.reg_operand(offset, 3);
                let count = self.u16_operand(offset, 5);
                let mut values = Vec::with_capacity(usize::from(count));
                for i in 0..count {
                    let reg = RegisterId::new(arg_base.raw() + i);
                    values.push(self.registers.get_register(reg));
                }
                let gc = self.heap.alloc_array(values);
                self.registers.set_register(dst, Value::Array(gc));
                Ok(None)
            }
            ArrayPush => {
                let array_reg = self.reg_operand(offset, 1);
                let value_reg = self.reg_operand(offset, 3);
                let value = self.registers.get_register(value_reg);
                match self.registers.get_register(array_reg) {
                    Value::Array(gc) => {
                        if let crate::heap::ObjPayload::Array(cell) = gc.payload() {
                            cell.borrow_mut().push(value);
                        }
                        Ok(None)
                    }
                    _ => Ok(Some(self.raise(RuntimeError::type_mismatch("array", self.current_location(offset))))),
                }
            }
            GetIter => {
                let dst = self.reg_operand(offset, 1);
                let src = self.reg_operand(offset, 3);
                self.do_get_iter(dst, src, offset)
            }
            IterNext => {
                let iter = self.reg_operand(offset, 1);
                let dst = self.reg_operand(offset, 3);
                let has_value = self.reg_operand(offset, 5);
                self.do_iter_next(iter, dst, has_value, offset)
            }
            Print => {
                let src = self.reg_operand(offset, 1);
                let value = self.registers.get_register(src);
                println!("{value}");
                Ok(None)
            }
            AssertEq => {
                let a = self.reg_operand(offset, 1);
                let b = self.reg_operand(offset, 3);
                let av = self.registers.get_register(a);
                let bv = self.registers.get_register(b);
                if values_equal(&av, &bv) {
                    Ok(None)
                } else {
                    Ok(Some(self.raise(RuntimeError::new(
                        crate::error::RuntimeErrorKind::Runtime,
                        format!("assertion failed: {av} != {bv}"),
                        self.current_location(offset),
                    ))))
                }
            }
            Halt => Ok(Some(self.do_return(Value::Nil))),

            LoadI32Const => self.load_typed_const(offset, ValueKind::I32),
            LoadI64Const => self.load_typed_const(offset, ValueKind::I64),
            LoadU32Const => self.load_typed_const(offset, ValueKind::U32),
            LoadU64Const => self.load_typed_const(offset, ValueKind::U64),
            LoadF64Const => self.load_typed_const(offset, ValueKind::F64),

            AddI32Typed => self.typed3(offset, |vm, d, a, b, o| typed_arith!(vm, d, a, b, o, I32, checked_add, I32)),
            SubI32Typed => self.typed3(offset, |vm, d, a, b, o| typed_arith!(vm, d, a, b, o, I32, checked_sub, I32)),
            MulI32Typed => self.typed3(offset, |vm, d, a, b, o| typed_arith!(vm, d, a, b, o, I32, checked_mul, I32)),
            DivI32Typed => self.typed3(offset, |vm, d, a, b, o| typed_int_div!(vm, d, a, b, o, I32, checked_div, false)),
            ModI32Typed => self.typed3(offset, |vm, d, a, b, o| typed_int_div!(vm, d, a, b, o, I32, checked_rem, true)),

            AddI64Typed => self.typed3(offset, |vm, d, a, b, o| typed_arith!(vm, d, a, b, o, I64, checked_add, I64)),
            SubI64Typed => self.typed3(offset, |vm, d, a, b, o| typed_arith!(vm, d, a, b, o, I64, checked_sub, I64)),
            MulI64Typed => self.typed3(offset, |vm, d, a, b, o| typed_arith!(vm, d, a, b, o, I64, checked_mul, I64)),
            DivI64Typed => self.typed3(offset, |vm, d, a, b, o| typed_int_div!(vm, d, a, b, o, I64, checked_div, false)),
            ModI64Typed => self.typed3(offset, |vm, d, a, b, o| typed_int_div!(vm, d, a, b, o, I64, checked_rem, true)),

            AddU32Typed => self.typed3(offset, |vm, d, a, b, o| typed_wrapping_arith!(vm, d, a, b, o, wrapping_add, U32)),
            SubU32Typed => self.typed3(offset, |vm, d, a, b, o| typed_wrapping_arith!(vm, d, a, b, o, wrapping_sub, U32)),
            MulU32Typed => self.typed3(offset, |vm, d, a, b, o| typed_wrapping_arith!(vm, d, a, b, o, wrapping_mul, U32)),
            DivU32Typed => self.typed3(offset, |vm, d, a, b, o| typed_int_div!(vm, d, a, b, o, U32, checked_div, false)),
            ModU32Typed => self.typed3(offset, |vm, d, a, b, o| typed_int_div!(vm, d, a, b, o, U32, checked_rem, true)),

            AddU64Typed => self.typed3(offset, |vm, d, a, b, o| typed_wrapping_arith!(vm, d, a, b, o, wrapping_add, U64)),
            SubU64Typed => self.typed3(offset, |vm, d, a, b, o| typed_wrapping_arith!(vm, d, a, b, o, wrapping_sub, U64)),
            MulU64Typed => self.typed3(offset, |vm, d, a, b, o| typed_wrapping_arith!(vm, d, a, b, o, wrapping_mul, U64)),
            DivU64Typed => self.typed3(offset, |vm, d, a, b, o| typed_int_div!(vm, d, a, b, o, U64, checked_div, false)),
            ModU64Typed => self.typed3(offset, |vm, d, a, b, o| typed_int_div!(vm, d, a, b, o, U64, checked_rem, true)),

            AddF64Typed => self.typed_f64(offset, |a, b| a + b),
            SubF64Typed => self.typed_f64(offset, |a, b| a - b),
            MulF64Typed => self.typed_f64(offset, |a, b| a * b),
            DivF64Typed => self.typed_f64(offset, |a, b| a / b),
            ModF64Typed => self.typed_f64(offset, |a, b| a % b),

            IncI32R => self.inc_dec(offset, ValueKind::I32, true),
            DecI32R => self.inc_dec(offset, ValueKind::I32, false),
            IncI64R => self.inc_dec(offset, ValueKind::I64, true),
            DecI64R => self.inc_dec(offset, ValueKind::I64, false),
            IncU32R => self.inc_dec(offset, ValueKind::U32, true),
            DecU32R => self.inc_dec(offset, ValueKind::U32, false),
            IncU64R => self.inc_dec(offset, ValueKind::U64, true),
            DecU64R => self.inc_dec(offset, ValueKind::U64, false),

            LtI32Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, I32, <)),
            LtI64Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, I64, <)),
            LtU32Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, U32, <)),
            LtU64Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, U64, <)),
            LtF64Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, F64, <)),
            EqI32Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, I32, ==)),
            EqI64Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, I64, ==)),
            EqU32Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, U32, ==)),
            EqU64Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, U64, ==)),
            EqF64Typed => self.typed3(offset, |vm, d, a, b, o| typed_cmp!(vm, d, a, b, o, F64, ==)),

            IncCmpJmp => self.do_fused(offset, true),
            DecCmpJmp => self.do_fused(offset, false),

            GuardI32 => self.do_guard(offset, ValueKind::I32),
            GuardI64 => self.do_guard(offset, ValueKind::I64),
            GuardU32 => self.do_guard(offset, ValueKind::U32),
            GuardU64 => self.do_guard(offset, ValueKind::U64),
            GuardF64 => self.do_guard(offset, ValueKind::F64),
        }
    }

    fn reg_operand(&self, instr_offset: usize, operand_offset: usize) -> RegisterId {
        self.current_chunk().read_register(instr_offset + operand_offset)
    }

    fn u16_operand(&self, instr_offset: usize, operand_offset: usize) -> u16 {
        self.current_chunk().read_u16(instr_offset + operand_offset)
    }

    fn i16_operand(&self, instr_offset: usize, operand_offset: usize) -> i16 {
        self.current_chunk().read_i16(instr_offset + operand_offset)
    }

    fn materialize_constant(&mut self, constant: crate::chunk::Constant) -> Value {
        use crate::chunk::Constant;
        match constant {
            Constant::I32(v) => Value::I32(v),
            Constant::I64(v) => Value::I64(v),
            Constant::U32(v) => Value::U32(v),
            Constant::U64(v) => Value::U64(v),
            Constant::F64(v) => Value::F64(v),
            Constant::Bool(v) => Value::Bool(v),
            Constant::Nil => Value::Nil,
            Constant::Str(s) => Value::String(self.heap.alloc_string(s)),
            Constant::FunctionIndex(idx) => Value::U32(idx),
        }
    }

    fn load_typed_const(&mut self, offset: usize, kind: ValueKind) -> OrusResult<Option<InterpretResult>> {
        let dst = self.reg_operand(offset, 1);
        let idx = self.u16_operand(offset, 3);
        let constant = self.current_chunk().constant(idx)?.clone();
        use crate::chunk::Constant;
        let payload = match (constant, kind) {
            (Constant::I32(v), ValueKind::I32) => TypedPayload::I32(v),
            (Constant::I64(v), ValueKind::I64) => TypedPayload::I64(v),
            (Constant::U32(v), ValueKind::U32) => TypedPayload::U32(v),
            (Constant::U64(v), ValueKind::U64) => TypedPayload::U64(v),
            (Constant::F64(v), ValueKind::F64) => TypedPayload::F64(v),
            _ => {
                return Ok(Some(self.raise(RuntimeError::type_mismatch(
                    "constant pool entry kind mismatch",
                    self.current_location(offset),
                ))))
            }
        };
        self.registers.store_typed_hot(dst, payload);
        Ok(None)
    }

    fn typed3(
        &mut self,
        offset: usize,
        f: impl FnOnce(&mut Vm, RegisterId, RegisterId, RegisterId, usize) -> OrusResult<Option<InterpretResult>>,
    ) -> OrusResult<Option<InterpretResult>> {
        let dst = self.reg_operand(offset, 1);
        let a = self.reg_operand(offset, 3);
        let b = self.reg_operand(offset, 5);
        f(self, dst, a, b, offset)
    }

    fn typed_f64(&mut self, offset: usize, f: impl FnOnce(f64, f64) -> f64) -> OrusResult<Option<InterpretResult>> {
        let dst = self.reg_operand(offset, 1);
        let a_reg = self.reg_operand(offset, 3);
        let b_reg = self.reg_operand(offset, 5);
        let a = match read_numeric(self, a_reg) {
            Some(TypedPayload::F64(v)) => v,
            _ => return Ok(Some(self.raise(RuntimeError::type_mismatch("f64", self.current_location(offset))))),
        };
        let b = match read_numeric(self, b_reg) {
            Some(TypedPayload::F64(v)) => v,
            _ => return Ok(Some(self.raise(RuntimeError::type_mismatch("f64", self.current_location(offset))))),
        };
        self.registers.store_typed_hot(dst, TypedPayload::F64(f(a, b)));
        Ok(None)
    }

    fn inc_dec(&mut self, offset: usize, kind: ValueKind, inc: bool) -> OrusResult<Option<InterpretResult>> {
        let reg = self.reg_operand(offset, 1);
        let payload = match read_numeric(self, reg) {
            Some(p) if p.kind() == kind => p,
            _ => return Ok(Some(self.raise(RuntimeError::type_mismatch("numeric register", self.current_location(offset))))),
        };
        let updated = match step_payload(payload, inc) {
            Some(p) => p,
            None => return Ok(Some(self.raise(RuntimeError::overflow(self.current_location(offset))))),
        };
        self.registers.store_typed_hot(reg, updated);
        Ok(None)
    }

    /// `INC_CMP_JMP` / `DEC_CMP_JMP`: increment/decrement the counter,
    /// compare against the limit, and take the branch, as a single
    /// atomic step. On overflow, nothing is written and no branch is
    /// taken.
    fn do_fused(&mut self, offset: usize, inc: bool) -> OrusResult<Option<InterpretResult>> {
        let counter_reg = self.reg_operand(offset, 1);
        let limit_reg = self.reg_operand(offset, 3);
        let rel = self.i16_operand(offset, 5);

        let counter = match read_numeric(self, counter_reg) {
            Some(p) => p,
            None => return Ok(Some(self.raise(RuntimeError::type_mismatch("counter register", self.current_location(offset))))),
        };
        let limit = match read_numeric(self, limit_reg) {
            Some(p) => p,
            None => return Ok(Some(self.raise(RuntimeError::type_mismatch("limit register", self.current_location(offset))))),
        };
        if counter.kind() != limit.kind() {
            return Ok(Some(self.raise(RuntimeError::type_mismatch(
                "counter/limit kind mismatch",
                self.current_location(offset),
            ))));
        }

        let updated = match step_payload(counter, inc) {
            Some(p) => p,
            None => return Ok(Some(self.raise(RuntimeError::overflow(self.current_location(offset))))),
        };
        self.registers.store_typed_hot(counter_reg, updated);

        let take_branch = compare_for_fused(updated, limit, inc)?;
        match take_branch {
            Some(true) => {
                self.ip = (self.ip as i64 + rel as i64) as usize;
                self.maybe_collect();
                if let Some(result) = self.maybe_tier_up_at(self.ip) {
                    return Ok(Some(result));
                }
            }
            Some(false) => {}
            None => {
                return Ok(Some(self.raise(RuntimeError::type_mismatch(
                    "fused loop only supports I32/I64/U32/U64 counters",
                    self.current_location(offset),
                ))))
            }
        }
        Ok(None)
    }

    fn do_concat(&mut self, dst: RegisterId, a: RegisterId, b: RegisterId, offset: usize) -> OrusResult<Option<InterpretResult>> {
        let av = self.registers.get_register(a);
        let bv = self.registers.get_register(b);
        let (sa, sb) = match (av, bv) {
            (Value::String(ga), Value::String(gb)) => {
                let sa = match ga.payload() {
                    crate::heap::ObjPayload::String(s) => s.clone(),
                    _ => unreachable!(),
                };
                let sb = match gb.payload() {
                    crate::heap::ObjPayload::String(s) => s.clone(),
                    _ => unreachable!(),
                };
                (sa, sb)
            }
            _ => return Ok(Some(self.raise(RuntimeError::type_mismatch("string", self.current_location(offset))))),
        };
        let gc = self.heap.alloc_string(sa + &sb);
        self.registers.set_register(dst, Value::String(gc));
        Ok(None)
    }

    fn do_get_iter(&mut self, dst: RegisterId, src: RegisterId, offset: usize) -> OrusResult<Option<InterpretResult>> {
        let value = self.registers.get_register(src);
        let gc = match value {
            Value::Range(gc) => {
                let range = match gc.payload() {
                    crate::heap::ObjPayload::Range(r) => *r,
                    _ => unreachable!(),
                };
                self.heap.alloc_range_iterator(ObjRangeIterator {
                    current: range.start,
                    end: range.end,
                    step: range.step,
                })
            }
            Value::Array(gc) => self.heap.alloc_array_iterator(ObjArrayIterator { array: gc, index: 0 }),
            _ => return Ok(Some(self.raise(RuntimeError::type_mismatch("iterable", self.current_location(offset))))),
        };
        let wrapped = match value {
            Value::Range(_) => Value::RangeIterator(gc),
            _ => Value::ArrayIterator(gc),
        };
        self.registers.set_register(dst, wrapped);
        Ok(None)
    }

    fn do_iter_next(
        &mut self,
        iter: RegisterId,
        dst: RegisterId,
        has_value: RegisterId,
        offset: usize,
    ) -> OrusResult<Option<InterpretResult>> {
        match self.registers.get_register(iter) {
            Value::RangeIterator(gc) => {
                let state = match gc.payload() {
                    crate::heap::ObjPayload::RangeIterator(cell) => cell.get(),
                    _ => unreachable!(),
                };
                let more = if state.step > 0 { state.current < state.end } else { state.current > state.end };
                if more {
                    self.registers.set_register(dst, Value::I64(state.current));
                    self.registers.set_register(has_value, Value::Bool(true));
                    if let crate::heap::ObjPayload::RangeIterator(cell) = gc.payload() {
                        cell.set(ObjRangeIterator {
                            current: state.current + state.step,
                            ..state
                        });
                    }
                } else {
                    self.registers.set_register(has_value, Value::Bool(false));
                }
                Ok(None)
            }
            Value::ArrayIterator(gc) => {
                let (array, index) = match gc.payload() {
                    crate::heap::ObjPayload::ArrayIterator(cell) => {
                        let s = cell.borrow();
                        (s.array, s.index)
                    }
                    _ => unreachable!(),
                };
                let len = match array.payload() {
                    crate::heap::ObjPayload::Array(values) => values.borrow().len(),
                    _ => unreachable!(),
                };
                if index < len {
                    let value = match array.payload() {
                        crate::heap::ObjPayload::Array(values) => values.borrow()[index],
                        _ => unreachable!(),
                    };
                    self.registers.set_register(dst, value);
                    self.registers.set_register(has_value, Value::Bool(true));
                    if let crate::heap::ObjPayload::ArrayIterator(cell) = gc.payload() {
                        cell.borrow_mut().index = index + 1;
                    }
                } else {
                    self.registers.set_register(has_value, Value::Bool(false));
                }
                Ok(None)
            }
            _ => Ok(Some(self.raise(RuntimeError::type_mismatch("iterator", self.current_location(offset))))),
        }
    }

    fn do_call(&mut self, offset: usize, _tail: bool) -> OrusResult<Option<InterpretResult>> {
        let dst = self.reg_operand(offset, 1);
        let func_idx = self.u16_operand(offset, 3);
        let arg_base = self.reg_operand(offset, 5);
        let arg_count = self.current_chunk().read_u8(offset + 7);
        self.enter_call(func_idx, arg_base, arg_count, dst, offset)
    }

    fn do_call_native(&mut self, offset: usize) -> OrusResult<Option<InterpretResult>> {
        let dst = self.reg_operand(offset, 1);
        let native_idx = self.u16_operand(offset, 3);
        let arg_base = self.reg_operand(offset, 5);
        let arg_count = self.current_chunk().read_u8(offset + 7);
        let args: Vec<Value> = (0..arg_count)
            .map(|i| self.registers.get_register(RegisterId::new(arg_base.raw() + u16::from(i))))
            .collect();
        let f = match self.natives.get(usize::from(native_idx)) {
            Some(f) => *f,
            None => return Err(OrusError::InvariantViolation(format!("native index {native_idx} out of range"))),
        };
        match f(&args, &mut self.heap) {
            Ok(value) => {
                self.registers.set_register(dst, value);
                self.maybe_collect();
                Ok(None)
            }
            Err(OrusError::InvariantViolation(msg)) => {
                Ok(Some(self.raise(RuntimeError::new(crate::error::RuntimeErrorKind::Runtime, msg, self.current_location(offset)))))
            }
            Err(e) => Err(e),
        }
    }

    /// `GUARD_*`: the parameter at `reg` must still carry `kind`. A
    /// mismatch is not a runtime error -- it means the call that
    /// crossed the specialization threshold observed a different
    /// parameter kind than the call in progress now, so the
    /// specialized chunk's body would silently miscompile the call.
    /// Deopt back to baseline and let the dispatch loop continue from
    /// there, exactly as if the specialized chunk had never existed
    /// for this call.
    fn do_guard(&mut self, offset: usize, kind: ValueKind) -> OrusResult<Option<InterpretResult>> {
        let reg = self.reg_operand(offset, 1);
        if self.registers.get_register(reg).kind() != kind {
            self.enter_function_deopt(self.current_function);
        }
        Ok(None)
    }

    /// A specialized chunk's guard failed for `func`: drop the
    /// specialized chunk, blocklist the function so it never attempts
    /// specialization again, and rewind to the baseline chunk's entry
    /// point. No frame state needs undoing since a guard is always the
    /// first thing a specialized chunk runs, before any body
    /// instruction has executed.
    fn enter_function_deopt(&mut self, func: usize) {
        self.tiering.deopt_specialized(func);
        self.profiler.blocklist_specialization(func);
        self.ip = 0;
        crate::log::jit_event!(?func, "specialized call deopted, falling back to the baseline chunk");
    }

    /// Called on every call to `func` with its already-reconciled
    /// boxed arguments: record the call's hotness, and the first time
    /// it crosses the threshold, build and install a specialized chunk
    /// guarded on the observed argument kinds.
    fn maybe_specialize_call(&mut self, func: usize, args: &[Value]) {
        use crate::profiler::TierUpDecision;
        use crate::tiering::Tier;
        if self.tiering.tier(func) == Tier::Specialized || self.profiler.is_specialization_blocklisted(func) {
            return;
        }
        if self.profiler.record_call(func) == TierUpDecision::AttemptTierUp {
            let param_kinds: Vec<ValueKind> = args.iter().map(|v| v.kind()).collect();
            match crate::jit::specialize::build_specialized_chunk(&self.functions[func], &param_kinds) {
                Ok(chunk) => self.tiering.install_specialized(func, chunk),
                Err(err) => {
                    crate::log::jit_event!(?err, "specialization failed, blocklisting function");
                    self.profiler.blocklist_specialization(func);
                }
            }
        }
    }

    fn do_tail_call(&mut self, offset: usize) -> OrusResult<Option<InterpretResult>> {
        let func_idx = self.u16_operand(offset, 1);
        let arg_base = self.reg_operand(offset, 3);
        let arg_count = self.current_chunk().read_u8(offset + 5);

        let args: Vec<Value> = (0..arg_count)
            .map(|i| self.registers.get_register(RegisterId::new(arg_base.raw() + u16::from(i))))
            .collect();
        let idx = usize::from(func_idx);
        self.maybe_specialize_call(idx, &args);
        let proto_register_count = self.functions[idx].register_count;
        let proto_temp_count = self.functions[idx].temp_count;
        if !self.arity_check(&self.functions[idx], arg_count) {
            return Ok(Some(self.raise(RuntimeError::new(
                crate::error::RuntimeErrorKind::Runtime,
                format!("arity mismatch calling {}", self.functions[idx].name),
                self.current_location(offset),
            ))));
        }
        // Reuses the caller's frame: free then realloc, which in the
        // absence of an intervening allocation hands back the same
        // pooled window.
        self.registers.frame_free(&self.heap);
        self.registers
            .frame_alloc(&mut self.heap, proto_register_count, proto_temp_count, RegisterId::new(GLOBAL_BAND_SIZE), RegisterId::new(GLOBAL_BAND_SIZE))?;
        for (i, value) in args.into_iter().enumerate() {
            self.registers.set_register(RegisterId::new(GLOBAL_BAND_SIZE + i as u16), value);
        }
        self.current_function = idx;
        self.ip = 0;
        Ok(None)
    }

    fn enter_call(
        &mut self,
        func_idx: u16,
        arg_base: RegisterId,
        arg_count: u8,
        dst: RegisterId,
        offset: usize,
    ) -> OrusResult<Option<InterpretResult>> {
        let idx = usize::from(func_idx);
        let proto = self
            .functions
            .get(idx)
            .ok_or_else(|| OrusError::InvariantViolation(format!("function index {idx} out of range")))?;
        if !self.arity_check(proto, arg_count) {
            return Ok(Some(self.raise(RuntimeError::new(
                crate::error::RuntimeErrorKind::Runtime,
                format!("arity mismatch calling {}", proto.name),
                self.current_location(offset),
            ))));
        }
        let register_count = proto.register_count;
        let temp_count = proto.temp_count;

        let args: Vec<Value> = (0..arg_count)
            .map(|i| self.registers.get_register(RegisterId::new(arg_base.raw() + u16::from(i))))
            .collect();
        self.maybe_specialize_call(idx, &args);

        self.call_stack.push(CallInfo {
            caller_function: self.current_function,
            return_ip: self.ip,
        });
        self.registers
            .frame_alloc(&mut self.heap, register_count, temp_count, RegisterId::new(GLOBAL_BAND_SIZE), dst)?;
        for (i, value) in args.into_iter().enumerate() {
            self.registers.set_register(RegisterId::new(GLOBAL_BAND_SIZE + i as u16), value);
        }
        self.current_function = idx;
        self.ip = 0;
        Ok(None)
    }

    fn do_return(&mut self, value: Value) -> InterpretResult {
        match self.call_stack.pop() {
            None => {
                self.registers.frame_free(&self.heap);
                InterpretResult::Ok
            }
            Some(info) => {
                let dst = self.registers.active_frame().expect("active frame on return").result_register;
                self.registers.frame_free(&self.heap);
                self.registers.set_register(dst, value);
                self.current_function = info.caller_function;
                self.ip = info.return_ip;
                self.maybe_collect();
                InterpretResult::Ok
            }
        }
    }

    /// Record the back-edge with the profiler, attempt translation if
    /// it just went hot, and replay a cached native entry if one
    /// exists. A return value means the active frame returned or
    /// raised while inside the native trace and `step`'s caller should
    /// stop the dispatch loop with it, exactly as if the baseline
    /// interpreter itself had hit `RETURN`/`HALT`/an error.
    fn maybe_tier_up_at(&mut self, loop_offset: usize) -> Option<InterpretResult> {
        use crate::profiler::TierUpDecision;
        let func = self.current_function;
        let decision = self.profiler.record_back_edge(func, loop_offset);
        if decision == TierUpDecision::AttemptTierUp {
            self.attempt_tier_up(func, loop_offset);
        }
        // Clone out of the table before the `&mut self` call below --
        // `entry` borrows `self.tiering` and `run_ir` needs all of `self`.
        let program = self.tiering.lookup(func, loop_offset)?.program.clone();
        match self.run_ir(&program) {
            NativeOutcome::Completed | NativeOutcome::Deopt => None,
            NativeOutcome::Returned(result) | NativeOutcome::Raised(result) => Some(result),
        }
    }

    fn attempt_tier_up(&mut self, func: usize, loop_offset: usize) {
        match crate::jit::translate::translate_linear_block(self, func, loop_offset) {
            Ok(program) => match crate::jit::backend::compile_ir(&program, self.config()) {
                Ok(entry) => {
                    self.tiering.install(func, loop_offset, entry);
                }
                Err(status) => {
                    crate::log::jit_event!(?status, "jit compilation failed, blocklisting loop");
                    self.profiler.blocklist(func, loop_offset);
                }
            },
            Err(status) => {
                crate::log::jit_event!(?status, "translation failed, blocklisting loop");
                self.tiering.record_translate_failure(status);
                if status != crate::jit::translate::TranslateStatus::RolloutDisabled {
                    self.profiler.blocklist(func, loop_offset);
                }
            }
        }
    }

    /// Replay a translated loop body node by node. This is the shared
    /// executor behind both backend kinds named in [`crate::jit::backend`]:
    /// there is no machine code here, only a second, narrower
    /// interpreter over the IR that trusts the type guards translation
    /// already checked and deopts the moment one of them is violated.
    fn run_ir(&mut self, program: &Program) -> NativeOutcome {
        'trace: loop {
            for node in &program.nodes {
                match &node.op {
                    IrOp::LoadConst { dst, kind, bits } => {
                        self.registers.store_typed_hot(*dst, payload_from_bits(*kind, *bits));
                    }
                    IrOp::LoadString { dst, text } => {
                        let gc = self.heap.alloc_string(text.clone());
                        self.registers.set_register(*dst, Value::String(gc));
                    }
                    IrOp::Arith { op, kind, dst, a, b } | IrOp::HelperArith { op, kind, dst, a, b } => {
                        match self.ir_arith(*op, *kind, *dst, *a, *b, node) {
                            ArithStep::Ok => {}
                            ArithStep::Deopt => {
                                self.enter_deopt(program, node);
                                return NativeOutcome::Deopt;
                            }
                            ArithStep::Raised(result) => return NativeOutcome::Raised(result),
                        }
                    }
                    IrOp::Cmp { op, kind, dst, a, b } => match self.ir_cmp(*op, *kind, *dst, *a, *b) {
                        CmpStep::Ok => {}
                        CmpStep::Deopt => {
                            self.enter_deopt(program, node);
                            return NativeOutcome::Deopt;
                        }
                    },
                    IrOp::Move { dst, src } => {
                        let v = self.registers.get_register(*src);
                        self.registers.set_register(*dst, v);
                    }
                    IrOp::Concat { dst, a, b } => match self.do_concat(*dst, *a, *b, node.bytecode_offset) {
                        Ok(None) => {}
                        Ok(Some(result)) => return NativeOutcome::Raised(result),
                        Err(_) => return NativeOutcome::Raised(InterpretResult::CompileError),
                    },
                    IrOp::GetIter { dst, src } => match self.do_get_iter(*dst, *src, node.bytecode_offset) {
                        Ok(None) => {}
                        Ok(Some(result)) => return NativeOutcome::Raised(result),
                        Err(_) => return NativeOutcome::Raised(InterpretResult::CompileError),
                    },
                    IrOp::IterNext { iter, dst, has_value } => {
                        match self.do_iter_next(*iter, *dst, *has_value, node.bytecode_offset) {
                            Ok(None) => {}
                            Ok(Some(result)) => return NativeOutcome::Raised(result),
                            Err(_) => return NativeOutcome::Raised(InterpretResult::CompileError),
                        }
                    }
                    IrOp::Print { src } => {
                        let value = self.registers.get_register(*src);
                        println!("{value}");
                    }
                    IrOp::AssertEq { a, b } => {
                        let av = self.registers.get_register(*a);
                        let bv = self.registers.get_register(*b);
                        if !values_equal(&av, &bv) {
                            let result = self.raise(RuntimeError::new(
                                crate::error::RuntimeErrorKind::Runtime,
                                format!("assertion failed: {av} != {bv}"),
                                self.current_location(node.bytecode_offset),
                            ));
                            return NativeOutcome::Raised(result);
                        }
                    }
                    IrOp::MakeArray { dst, arg_base, arg_count } => {
                        let mut values = Vec::with_capacity(usize::from(*arg_count));
                        for i in 0..*arg_count {
                            values.push(self.registers.get_register(RegisterId::new(arg_base.raw() + i)));
                        }
                        let gc = self.heap.alloc_array(values);
                        self.registers.set_register(*dst, Value::Array(gc));
                    }
                    IrOp::ArrayPush { array, value } => {
                        let value = self.registers.get_register(*value);
                        match self.registers.get_register(*array) {
                            Value::Array(gc) => {
                                if let crate::heap::ObjPayload::Array(cell) = gc.payload() {
                                    cell.borrow_mut().push(value);
                                }
                            }
                            _ => {
                                let result =
                                    self.raise(RuntimeError::type_mismatch("array", self.current_location(node.bytecode_offset)));
                                return NativeOutcome::Raised(result);
                            }
                        }
                    }
                    IrOp::CallNative { dst, native_id, spill_base, spill_count } => {
                        let args: Vec<Value> = (0..*spill_count)
                            .map(|i| self.registers.get_register(RegisterId::new(spill_base.raw() + u16::from(i))))
                            .collect();
                        let f = match self.natives.get(usize::from(*native_id)) {
                            Some(f) => *f,
                            None => return NativeOutcome::Raised(InterpretResult::CompileError),
                        };
                        match f(&args, &mut self.heap) {
                            Ok(value) => {
                                self.registers.set_register(*dst, value);
                                self.maybe_collect();
                            }
                            Err(OrusError::InvariantViolation(msg)) => {
                                let result = self.raise(RuntimeError::new(
                                    crate::error::RuntimeErrorKind::Runtime,
                                    msg,
                                    self.current_location(node.bytecode_offset),
                                ));
                                return NativeOutcome::Raised(result);
                            }
                            Err(_) => return NativeOutcome::Raised(InterpretResult::CompileError),
                        }
                    }
                    IrOp::JumpShort { .. } | IrOp::JumpIfNotShort { .. } => {
                        unreachable!("reserved IR ops, not yet produced by translation")
                    }
                    IrOp::LoopBack { counter, limit, kind, increment, offset: _ } => {
                        match self.ir_loop_back(*counter, *limit, *kind, *increment, node) {
                            LoopBackStep::Continue => continue 'trace,
                            LoopBackStep::Exit => {
                                self.ip = node.bytecode_offset + node.bytecode_length;
                                return NativeOutcome::Completed;
                            }
                            LoopBackStep::Deopt => {
                                self.enter_deopt(program, node);
                                return NativeOutcome::Deopt;
                            }
                            LoopBackStep::Raised(result) => return NativeOutcome::Raised(result),
                        }
                    }
                    IrOp::Return { src } => {
                        let value = match src {
                            Some(r) => self.registers.get_register(*r),
                            None => Value::Nil,
                        };
                        return NativeOutcome::Returned(self.do_return(value));
                    }
                    IrOp::Safepoint => self.maybe_collect(),
                }
            }
            // `LoopBack` is always the terminal node; reaching the end
            // of a program without one is the translator's contract
            // being violated, not a runtime condition to recover from.
            unreachable!("a translated program always ends in LoopBack or Return");
        }
    }

    fn ir_arith(
        &mut self,
        op: ArithOp,
        kind: ValueKind,
        dst: RegisterId,
        a: RegisterId,
        b: RegisterId,
        node: &IrNode,
    ) -> ArithStep {
        let pa = match self.registers.try_read_typed(a, kind) {
            Some(p) => p,
            None => return ArithStep::Deopt,
        };
        let pb = match self.registers.try_read_typed(b, kind) {
            Some(p) => p,
            None => return ArithStep::Deopt,
        };
        match apply_arith(op, pa, pb) {
            ArithResult::Value(p) => {
                self.registers.store_typed_hot(dst, p);
                ArithStep::Ok
            }
            ArithResult::Overflow => ArithStep::Raised(self.raise(RuntimeError::overflow(self.current_location(node.bytecode_offset)))),
            ArithResult::DivByZero => {
                ArithStep::Raised(self.raise(RuntimeError::div_by_zero(self.current_location(node.bytecode_offset))))
            }
        }
    }

    fn ir_cmp(&mut self, op: CmpOp, kind: ValueKind, dst: RegisterId, a: RegisterId, b: RegisterId) -> CmpStep {
        let pa = match self.registers.try_read_typed(a, kind) {
            Some(p) => p,
            None => return CmpStep::Deopt,
        };
        let pb = match self.registers.try_read_typed(b, kind) {
            Some(p) => p,
            None => return CmpStep::Deopt,
        };
        self.registers.store_typed_hot(dst, TypedPayload::Bool(apply_cmp(op, pa, pb)));
        CmpStep::Ok
    }

    fn ir_loop_back(
        &mut self,
        counter: RegisterId,
        limit: RegisterId,
        kind: ValueKind,
        increment: bool,
        node: &IrNode,
    ) -> LoopBackStep {
        let counter_payload = match self.registers.try_read_typed(counter, kind) {
            Some(p) => p,
            None => return LoopBackStep::Deopt,
        };
        let limit_payload = match self.registers.try_read_typed(limit, kind) {
            Some(p) => p,
            None => return LoopBackStep::Deopt,
        };
        let updated = match step_payload(counter_payload, increment) {
            Some(p) => p,
            None => return LoopBackStep::Raised(self.raise(RuntimeError::overflow(self.current_location(node.bytecode_offset)))),
        };
        self.registers.store_typed_hot(counter, updated);
        match compare_for_fused(updated, limit_payload, increment) {
            Ok(Some(true)) => LoopBackStep::Continue,
            Ok(Some(false)) => LoopBackStep::Exit,
            Ok(None) => LoopBackStep::Deopt,
            Err(_) => LoopBackStep::Raised(InterpretResult::CompileError),
        }
    }

    /// Reconcile every live typed slot in the active frame into its
    /// boxed mirror, metadata-clear the frame's locals/temps, rewind
    /// to the bytecode offset the failing node came from, and evict
    /// the loop so it never retraces against the observation that
    /// just proved wrong. The reconcile must happen before the clear:
    /// a hot-loop accumulator or counter is typically `dirty` (boxed
    /// mirror stale) right when a guard fails, and the baseline
    /// interpreter resuming at `node.bytecode_offset` reads the boxed
    /// register, not the typed one.
    fn enter_deopt(&mut self, program: &Program, node: &IrNode) {
        let proto = &self.functions[program.func];
        let range = crate::jit::deopt::frame_clear_range(proto.register_count, proto.temp_count);
        for raw in range.clone() {
            self.registers.reconcile_typed_register(RegisterId::new(raw));
        }
        self.registers
            .clear_metadata_range(RegisterId::new(range.start), RegisterId::new(range.end));
        self.ip = node.bytecode_offset;
        self.tiering.invalidate(program.func, program.loop_offset);
        self.tiering.record_type_deopt();
        self.profiler.blocklist(program.func, program.loop_offset);
        crate::log::jit_event!(
            ?program.func,
            ?program.loop_offset,
            "native trace deopted, falling back to the baseline interpreter"
        );
    }
}

/// What running a cached native entry produced.
#[derive(Debug)]
enum NativeOutcome {
    /// The loop exited normally; the baseline interpreter resumes
    /// after the fused instruction.
    Completed,
    /// A `Return`/`Halt` node inside the trace ended the function.
    Returned(InterpretResult),
    /// A type guard translation relied on no longer holds; the
    /// baseline interpreter resumes at the failing node's bytecode
    /// offset.
    Deopt,
    /// The trace raised a genuine runtime error (overflow, division by
    /// zero, a type mismatch unrelated to the loop's own counter/limit
    /// speculation).
    Raised(InterpretResult),
}

enum ArithStep {
    Ok,
    Deopt,
    Raised(InterpretResult),
}

enum CmpStep {
    Ok,
    Deopt,
}

enum LoopBackStep {
    Continue,
    Exit,
    Deopt,
    Raised(InterpretResult),
}

enum ArithResult {
    Value(TypedPayload),
    Overflow,
    DivByZero,
}

fn apply_arith(op: ArithOp, a: TypedPayload, b: TypedPayload) -> ArithResult {
    use TypedPayload::*;
    match (a, b) {
        (I32(x), I32(y)) => match op {
            ArithOp::Add => x.checked_add(y).map(I32).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Sub => x.checked_sub(y).map(I32).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Mul => x.checked_mul(y).map(I32).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Div if y == 0 => ArithResult::DivByZero,
            ArithOp::Div => x.checked_div(y).map(I32).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Mod if y == 0 => ArithResult::DivByZero,
            ArithOp::Mod => x.checked_rem(y).map(I32).map_or(ArithResult::Overflow, ArithResult::Value),
        },
        (I64(x), I64(y)) => match op {
            ArithOp::Add => x.checked_add(y).map(I64).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Sub => x.checked_sub(y).map(I64).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Mul => x.checked_mul(y).map(I64).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Div if y == 0 => ArithResult::DivByZero,
            ArithOp::Div => x.checked_div(y).map(I64).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Mod if y == 0 => ArithResult::DivByZero,
            ArithOp::Mod => x.checked_rem(y).map(I64).map_or(ArithResult::Overflow, ArithResult::Value),
        },
        (U32(x), U32(y)) => match op {
            ArithOp::Add => ArithResult::Value(U32(x.wrapping_add(y))),
            ArithOp::Sub => ArithResult::Value(U32(x.wrapping_sub(y))),
            ArithOp::Mul => ArithResult::Value(U32(x.wrapping_mul(y))),
            ArithOp::Div if y == 0 => ArithResult::DivByZero,
            ArithOp::Div => x.checked_div(y).map(U32).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Mod if y == 0 => ArithResult::DivByZero,
            ArithOp::Mod => x.checked_rem(y).map(U32).map_or(ArithResult::Overflow, ArithResult::Value),
        },
        (U64(x), U64(y)) => match op {
            ArithOp::Add => ArithResult::Value(U64(x.wrapping_add(y))),
            ArithOp::Sub => ArithResult::Value(U64(x.wrapping_sub(y))),
            ArithOp::Mul => ArithResult::Value(U64(x.wrapping_mul(y))),
            ArithOp::Div if y == 0 => ArithResult::DivByZero,
            ArithOp::Div => x.checked_div(y).map(U64).map_or(ArithResult::Overflow, ArithResult::Value),
            ArithOp::Mod if y == 0 => ArithResult::DivByZero,
            ArithOp::Mod => x.checked_rem(y).map(U64).map_or(ArithResult::Overflow, ArithResult::Value),
        },
        (F64(x), F64(y)) => ArithResult::Value(F64(match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            ArithOp::Mod => x % y,
        })),
        _ => unreachable!("kind-checked typed reads guarantee matching payload variants"),
    }
}

fn apply_cmp(op: CmpOp, a: TypedPayload, b: TypedPayload) -> bool {
    use TypedPayload::*;
    match (a, b) {
        (I32(x), I32(y)) => match op {
            CmpOp::Lt => x < y,
            CmpOp::Eq => x == y,
        },
        (I64(x), I64(y)) => match op {
            CmpOp::Lt => x < y,
            CmpOp::Eq => x == y,
        },
        (U32(x), U32(y)) => match op {
            CmpOp::Lt => x < y,
            CmpOp::Eq => x == y,
        },
        (U64(x), U64(y)) => match op {
            CmpOp::Lt => x < y,
            CmpOp::Eq => x == y,
        },
        (F64(x), F64(y)) => match op {
            CmpOp::Lt => x < y,
            CmpOp::Eq => x == y,
        },
        _ => unreachable!("kind-checked typed reads guarantee matching payload variants"),
    }
}

fn payload_from_bits(kind: ValueKind, bits: u64) -> TypedPayload {
    match kind {
        ValueKind::I32 => TypedPayload::I32(bits as u32 as i32),
        ValueKind::I64 => TypedPayload::I64(bits as i64),
        ValueKind::U32 => TypedPayload::U32(bits as u32),
        ValueKind::U64 => TypedPayload::U64(bits),
        ValueKind::F64 => TypedPayload::F64(f64::from_bits(bits)),
        ValueKind::Bool => TypedPayload::Bool(bits != 0),
        other => unreachable!("translator never emits LoadConst for {other:?}"),
    }
}

/// A limited `==`-only comparison used by `ASSERT_EQ`: reference kinds
/// compare by identity (two distinct strings with the same contents
/// are not `==`), matching a register VM's cheap equality rather than
/// deep structural equality.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(ga), Value::String(gb)) => match (ga.payload(), gb.payload()) {
            (crate::heap::ObjPayload::String(sa), crate::heap::ObjPayload::String(sb)) => sa == sb,
            _ => false,
        },
        _ => a == b,
    }
}

fn step_payload(p: TypedPayload, inc: bool) -> Option<TypedPayload> {
    match p {
        TypedPayload::I32(v) => (if inc { v.checked_add(1) } else { v.checked_sub(1) }).map(TypedPayload::I32),
        TypedPayload::I64(v) => (if inc { v.checked_add(1) } else { v.checked_sub(1) }).map(TypedPayload::I64),
        TypedPayload::U32(v) => Some(TypedPayload::U32(if inc { v.wrapping_add(1) } else { v.wrapping_sub(1) })),
        TypedPayload::U64(v) => Some(TypedPayload::U64(if inc { v.wrapping_add(1) } else { v.wrapping_sub(1) })),
        TypedPayload::F64(v) => Some(TypedPayload::F64(if inc { v + 1.0 } else { v - 1.0 })),
        TypedPayload::Bool(_) => None,
    }
}

/// `Some(true)`/`Some(false)` = branch decision; `None` = unsupported
/// kind for a fused loop (only the four integer kinds are specified).
fn compare_for_fused(counter: TypedPayload, limit: TypedPayload, inc: bool) -> OrusResult<Option<bool>> {
    use TypedPayload::*;
    let result = match (counter, limit) {
        (I32(c), I32(l)) => if inc { c < l } else { c > l },
        (I64(c), I64(l)) => if inc { c < l } else { c > l },
        (U32(c), U32(l)) => if inc { c < l } else { c > l },
        (U64(c), U64(l)) => if inc { c < l } else { c > l },
        _ => return Ok(None),
    };
    Ok(Some(result))
}
