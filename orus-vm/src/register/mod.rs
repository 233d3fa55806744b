//! Register file: frame stack, typed register window, spill area,
//! upvalue capture, and GC rooting.
//!
//! # Register ID address space
//!
//! Every opcode encodes its register operands as a 2-byte big-endian
//! field, the same width used for constant-pool indices, so a frame's
//! register count is never artificially capped by the instruction
//! encoding. [`RegisterId`] is a `u16` throughout the runtime (see
//! DESIGN.md).
//!
//! Three disjoint ranges partition [`RegisterId`]:
//! - `0..GLOBAL_BAND_SIZE`: the global band.
//! - `GLOBAL_BAND_SIZE..SPILL_REG_START`: frame-relative, resolved
//!   against the *active* frame's window.
//! - `SPILL_REG_START..`: spill-area keys.

mod spill;
mod typed_window;

pub use spill::SpillArea;
pub use typed_window::{PriorState, TypedWindow};

use crate::error::{OrusError, OrusResult};
use crate::heap::{FrameId, Gc, Heap, ObjPayload, UpvalueState};
use crate::value::{TypedPayload, Value, ValueKind};
use std::collections::HashSet;

pub const GLOBAL_BAND_SIZE: u16 = 64;
pub const SPILL_REG_START: u16 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId(u16);

impl RegisterId {
    pub const fn new(raw: u16) -> Self {
        RegisterId(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_spill(self) -> bool {
        self.0 >= SPILL_REG_START
    }

    pub fn is_global(self) -> bool {
        self.0 < GLOBAL_BAND_SIZE
    }

    fn spill_id(idx: usize) -> Self {
        let raw = u16::try_from(idx).expect("spill index overflowed u16") + SPILL_REG_START;
        RegisterId(raw)
    }

    fn spill_index(self) -> usize {
        debug_assert!(self.is_spill());
        usize::from(self.0 - SPILL_REG_START)
    }

    fn frame_local_index(self) -> usize {
        debug_assert!(!self.is_global() && !self.is_spill());
        usize::from(self.0 - GLOBAL_BAND_SIZE)
    }
}

/// A contiguous boxed+typed window, shared by the global band and by
/// every per-frame window (pooled and reused across frames).
#[derive(Debug)]
struct WindowStorage {
    boxed: Vec<Value>,
    typed: TypedWindow,
    /// Local indices pinned out of deferred-boxing by an open upvalue.
    pinned: HashSet<usize>,
}

impl WindowStorage {
    fn new(width: usize) -> Self {
        Self {
            boxed: vec![Value::Nil; width],
            typed: TypedWindow::new(width),
            pinned: HashSet::new(),
        }
    }

    fn ensure_width(&mut self, width: usize) {
        if width > self.boxed.len() {
            self.boxed.resize(width, Value::Nil);
        }
        self.typed.ensure_width(width);
    }

    fn clear_metadata(&mut self) {
        self.typed.clear_metadata();
        self.pinned.clear();
    }
}

/// One activation record on the interpreter's frame stack.
#[derive(Debug)]
pub struct Frame {
    pub id: FrameId,
    pub register_count: u16,
    pub temp_count: u16,
    pub parameter_base_register: RegisterId,
    pub result_register: RegisterId,
    storage: WindowStorage,
}

impl Frame {
    fn width(register_count: u16, temp_count: u16) -> usize {
        usize::from(register_count) + usize::from(temp_count)
    }
}

pub struct RegisterFile {
    global: WindowStorage,
    global_frame_id: FrameId,
    frames: Vec<Frame>,
    free_windows: Vec<WindowStorage>,
    spill: SpillArea,
    /// VM scratch registers: rooted, but not part of any frame's
    /// typed/boxed window.
    scratch: Vec<Value>,
    open_upvalues: Vec<Gc>,
    max_frames: usize,
}

impl RegisterFile {
    pub fn new(global_band_size: u16, heap: &mut Heap, max_frames: usize) -> Self {
        Self {
            global: WindowStorage::new(usize::from(global_band_size)),
            global_frame_id: heap.next_frame_id(),
            frames: Vec::new(),
            free_windows: Vec::new(),
            spill: SpillArea::new(),
            scratch: vec![Value::Nil; 4],
            open_upvalues: Vec::new(),
            max_frames,
        }
    }

    fn storage_for(&self, id: RegisterId) -> (&WindowStorage, usize) {
        if id.is_global() {
            (&self.global, usize::from(id.raw()))
        } else {
            let frame = self.frames.last().expect("register access with no active frame");
            (&frame.storage, id.frame_local_index())
        }
    }

    fn storage_for_mut(&mut self, id: RegisterId) -> (&mut WindowStorage, usize) {
        if id.is_global() {
            (&mut self.global, usize::from(id.raw()))
        } else {
            let frame = self
                .frames
                .last_mut()
                .expect("register access with no active frame");
            let local = id.frame_local_index();
            (&mut frame.storage, local)
        }
    }

    fn frame_id_for(&self, id: RegisterId) -> FrameId {
        if id.is_global() {
            self.global_frame_id
        } else {
            self.frames.last().expect("no active frame").id
        }
    }

    pub fn active_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    // ---- frame lifecycle --------------------------------------------------

    pub fn frame_alloc(
        &mut self,
        heap: &mut Heap,
        register_count: u16,
        temp_count: u16,
        parameter_base_register: RegisterId,
        result_register: RegisterId,
    ) -> OrusResult<()> {
        if self.frames.len() >= self.max_frames {
            return Err(OrusError::OutOfMemory {
                what: "frame stack",
                requested: self.frames.len() + 1,
            });
        }
        let width = Frame::width(register_count, temp_count);
        let mut storage = self
            .free_windows
            .pop()
            .unwrap_or_else(|| WindowStorage::new(width));
        storage.ensure_width(width);
        storage.clear_metadata();
        self.frames.push(Frame {
            id: heap.next_frame_id(),
            register_count,
            temp_count,
            parameter_base_register,
            result_register,
            storage,
        });
        Ok(())
    }

    /// Pop the active frame, closing any upvalues it still has open
    /// and returning its window to the pool.
    pub fn frame_free(&mut self, heap: &Heap) {
        let frame_id = self.frames.last().expect("frame_free with no active frame").id;
        self.close_upvalues_from(heap, frame_id, RegisterId::new(GLOBAL_BAND_SIZE));
        let frame = self.frames.pop().expect("frame_free with no active frame");
        self.free_windows.push(frame.storage);
    }

    // ---- boxed/typed register ops -----------------------------------------

    pub fn get_register(&mut self, id: RegisterId) -> Value {
        if id.is_spill() {
            return self.spill.get(id);
        }
        let (storage, local) = self.storage_for_mut(id);
        if storage.typed.is_dirty(local) {
            let payload = storage
                .typed
                .read_raw(local)
                .expect("dirty slot must be live");
            storage.boxed[local] = payload.to_value();
            storage.typed.set_dirty(local, false);
        }
        storage.boxed[local]
    }

    pub fn set_register(&mut self, id: RegisterId, value: Value) {
        if id.is_spill() {
            self.spill.set(id, value);
            return;
        }
        let (storage, local) = self.storage_for_mut(id);
        storage.boxed[local] = value;
        storage.typed.invalidate(local);
    }

    /// Write a typed value into the hot path, deferring the boxed
    /// mirror update when that's safe: see the coherence table in the
    /// typed-window module docs for the live/dirty state machine this
    /// maintains.
    pub fn store_typed_hot(&mut self, id: RegisterId, payload: TypedPayload) {
        debug_assert!(!id.is_spill(), "typed stores never target spill ids");
        let (storage, local) = self.storage_for_mut(id);
        let pinned = storage.pinned.contains(&local);
        let prior = storage.typed.write_live(local, payload);
        let eager = pinned
            || matches!(prior, PriorState::Unset)
            || matches!(prior, PriorState::Live { same_kind: false, .. });
        if eager {
            storage.boxed[local] = payload.to_value();
            storage.typed.set_dirty(local, false);
        } else {
            storage.typed.set_dirty(local, true);
        }
    }

    pub fn try_read_typed(&self, id: RegisterId, kind: ValueKind) -> Option<TypedPayload> {
        if id.is_spill() {
            return None;
        }
        let (storage, local) = self.storage_for(id);
        storage.typed.try_read(local, kind)
    }

    pub fn reconcile_typed_register(&mut self, id: RegisterId) -> Value {
        if id.is_spill() {
            return self.spill.get(id);
        }
        let (storage, local) = self.storage_for_mut(id);
        if let Some(payload) = storage.typed.read_raw(local) {
            storage.boxed[local] = payload.to_value();
            storage.typed.set_dirty(local, false);
        }
        storage.boxed[local]
    }

    pub fn typed_kind(&self, id: RegisterId) -> Option<ValueKind> {
        if id.is_spill() {
            return None;
        }
        let (storage, local) = self.storage_for(id);
        storage.typed.kind_at(local)
    }

    /// Metadata-clear a register range of the *active* frame, used by
    /// the deopt landing pad when returning control to the baseline
    /// interpreter. `from`/`to` are frame-relative register ids.
    pub fn clear_metadata_range(&mut self, from: RegisterId, to: RegisterId) {
        let frame = self.frames.last_mut().expect("no active frame");
        let lo = from.frame_local_index();
        let hi = to.frame_local_index();
        frame.storage.typed.clear_metadata_range(lo..hi);
    }

    // ---- spill area ---------------------------------------------------------

    pub fn allocate_spilled_register(&mut self, value: Value) -> RegisterId {
        self.spill.allocate(value)
    }

    pub fn set_spill(&mut self, id: RegisterId, value: Value) {
        self.spill.set(id, value);
    }

    pub fn unspill(&mut self, id: RegisterId) -> Value {
        self.spill.get(id)
    }

    pub fn remove_spill(&mut self, id: RegisterId) {
        self.spill.remove(id);
    }

    // ---- upvalues -----------------------------------------------------------

    /// Capture an upvalue over `id`, pinning it out of the
    /// deferred-boxing path for as long as the upvalue stays open.
    pub fn capture_upvalue(&mut self, heap: &mut Heap, id: RegisterId) -> Gc {
        // Ensure the boxed mirror is authoritative before anyone reads
        // through the upvalue.
        let _ = self.reconcile_typed_register(id);
        let frame_id = self.frame_id_for(id);
        let (storage, local) = self.storage_for_mut(id);
        storage.pinned.insert(local);
        let gc = heap.alloc_upvalue(UpvalueState::Open {
            frame: frame_id,
            register: id,
        });
        self.open_upvalues.push(gc);
        gc
    }

    /// Close every open upvalue belonging to `frame_id` whose register
    /// id is `>= from`, copying the live boxed value into the upvalue
    /// object and un-pinning the register.
    pub fn close_upvalues_from(&mut self, heap: &Heap, frame_id: FrameId, from: RegisterId) {
        let candidates = self.open_upvalues.clone();
        let mut still_open = Vec::with_capacity(candidates.len());
        for gc in candidates {
            let snapshot = match gc.payload() {
                ObjPayload::Upvalue(cell) => cell.borrow().clone(),
                _ => unreachable!("open_upvalues only ever holds Upvalue objects"),
            };
            if let UpvalueState::Open { frame, register } = snapshot {
                if frame == frame_id && register.raw() >= from.raw() {
                    let value = self.reconcile_typed_register(register);
                    if let ObjPayload::Upvalue(cell) = gc.payload() {
                        *cell.borrow_mut() = UpvalueState::Closed(value);
                    }
                    continue;
                }
            }
            still_open.push(gc);
        }
        self.open_upvalues = still_open;
        let _ = heap;
        if let Some(local_from) = (!from.is_global()).then(|| from.frame_local_index()) {
            if let Some(frame) = self.frames.last_mut() {
                frame.storage.pinned.retain(|&idx| idx < local_from);
            }
        }
    }

    /// Read an upvalue's current value: live through the owning
    /// frame's register if still open, or the captured snapshot if
    /// closed.
    pub fn read_upvalue(&mut self, gc: Gc) -> Value {
        let snapshot = match gc.payload() {
            ObjPayload::Upvalue(cell) => cell.borrow().clone(),
            _ => unreachable!(),
        };
        match snapshot {
            UpvalueState::Open { register, .. } => self.get_register(register),
            UpvalueState::Closed(v) => v,
        }
    }

    // ---- GC rooting -----------------------------------------------------------

    /// Every `Value` this register file itself keeps alive, excluding
    /// `vm.last_error` (the dispatcher threads that in separately
    /// since the register file has no notion of it).
    pub fn gc_roots(&self) -> impl Iterator<Item = Value> + '_ {
        let global = self.global.boxed.iter().copied();
        let frames = self
            .frames
            .iter()
            .flat_map(|f| f.storage.boxed.iter().copied());
        let spill = self.spill.live_values();
        let scratch = self.scratch.iter().copied();
        let upvalues = self.open_upvalues.iter().map(|g| match g.payload() {
            ObjPayload::Upvalue(_) => Value::Upvalue(*g),
            _ => unreachable!(),
        });
        global.chain(frames).chain(spill).chain(scratch).chain(upvalues)
    }

    pub fn scratch(&mut self, idx: usize) -> &mut Value {
        &mut self.scratch[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Heap, RegisterFile) {
        let mut heap = Heap::new(usize::MAX);
        let rf = RegisterFile::new(GLOBAL_BAND_SIZE, &mut heap, 64);
        (heap, rf)
    }

    fn local(n: u16) -> RegisterId {
        RegisterId::new(GLOBAL_BAND_SIZE + n)
    }

    #[test]
    fn flush_on_read_reconciles_dirty_typed_store() {
        let (mut heap, mut rf) = fixture();
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        rf.store_typed_hot(local(1), TypedPayload::I32(5));
        // First store after live-clear is eager: already clean.
        assert_eq!(rf.get_register(local(1)), Value::I32(5));
        assert!(!rf.typed_kind(local(1)).is_none());
        // Second same-kind store may defer.
        rf.store_typed_hot(local(1), TypedPayload::I32(9));
        let v = rf.get_register(local(1));
        assert_eq!(v, Value::I32(9));
    }

    #[test]
    fn deferred_store_keeps_stale_boxed_until_read() {
        let (mut heap, mut rf) = fixture();
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        rf.store_typed_hot(local(1), TypedPayload::I32(1));
        rf.store_typed_hot(local(1), TypedPayload::I32(2));
        // Without calling get_register/reconcile, nothing asserts the
        // boxed mirror moved -- but try_read_typed must see the new
        // value and dirty must be set.
        assert_eq!(
            rf.try_read_typed(local(1), ValueKind::I32),
            Some(TypedPayload::I32(2))
        );
        assert_eq!(rf.get_register(local(1)), Value::I32(2));
    }

    #[test]
    fn open_upvalue_pins_register_to_eager_boxing() {
        let (mut heap, mut rf) = fixture();
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        rf.store_typed_hot(local(1), TypedPayload::I32(1));
        let _uv = rf.capture_upvalue(&mut heap, local(1));
        rf.store_typed_hot(local(1), TypedPayload::I32(2));
        assert_eq!(rf.get_register(local(1)), Value::I32(2));
    }

    #[test]
    fn frame_reuse_bumps_generation_and_keeps_payload_bytes() {
        let (mut heap, mut rf) = fixture();
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        rf.store_typed_hot(local(0), TypedPayload::I64(0xdead));
        rf.frame_free(&heap);
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        // live bit must be cleared after reuse.
        assert_eq!(rf.try_read_typed(local(0), ValueKind::I64), None);
    }

    #[test]
    fn closing_an_upvalue_snapshots_the_current_value() {
        let (mut heap, mut rf) = fixture();
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        rf.store_typed_hot(local(0), TypedPayload::I32(41));
        let uv = rf.capture_upvalue(&mut heap, local(0));
        rf.store_typed_hot(local(0), TypedPayload::I32(42));
        rf.frame_free(&heap);
        assert_eq!(rf.read_upvalue(uv), Value::I32(42));
    }

    // Generalizes `flush_on_read_reconciles_dirty_typed_store` and
    // `deferred_store_keeps_stale_boxed_until_read` from a couple of
    // fixed values to any sequence of stores into the same register:
    // whatever the deferred-dirty bookkeeping does internally, a read
    // always reconciles to the most recent write.
    #[quickcheck_macros::quickcheck]
    fn repeated_i32_typed_stores_always_reconcile_to_the_last_value(values: Vec<i32>) -> bool {
        if values.is_empty() {
            return true;
        }
        let mut heap = Heap::new(usize::MAX);
        let mut rf = RegisterFile::new(GLOBAL_BAND_SIZE, &mut heap, 64);
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        for v in &values {
            rf.store_typed_hot(local(1), TypedPayload::I32(*v));
        }
        rf.get_register(local(1)) == Value::I32(*values.last().unwrap())
    }

    // The live bit a deopt clears must never leak a stale typed read
    // across a frame boundary, for any register index within the
    // frame's width, not just index 0.
    #[quickcheck_macros::quickcheck]
    fn frame_reuse_clears_the_live_bit_at_any_local_index(idx: u16) -> bool {
        let idx = idx % 4;
        let (mut heap, mut rf) = fixture();
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        rf.store_typed_hot(local(idx), TypedPayload::I64(0xbeef));
        rf.frame_free(&heap);
        rf.frame_alloc(&mut heap, 4, 0, local(0), local(0)).unwrap();
        rf.try_read_typed(local(idx), ValueKind::I64).is_none()
    }
}
