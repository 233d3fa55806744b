//! Heap & mark-sweep GC.
//!
//! Heap objects are intrusively linked in a single `objects` list:
//! each [`Heap`] owns a `Vec<Box<GcBox>>`, and a [`Gc`] handle is a
//! raw, non-owning pointer into one of those boxes. A `Box`'s heap
//! allocation has a stable address independent of the owning `Vec`'s
//! own reallocation, so `Gc` handles stay valid across pushes; they
//! are invalidated only when `sweep` drops the `Box` that backs them,
//! which by construction only happens for objects the mark phase did
//! not reach.
//!
//! Safety contract: a `Gc` must not be dereferenced after a collection
//! that did not mark it reachable. Every caller that stashes a `Gc`
//! (a register, a spill slot, an open upvalue, `vm.last_error`) is
//! therefore a GC root, and [`Heap::collect`] requires the caller to
//! supply the complete root set.

use crate::error::RuntimeError;
use crate::register::RegisterId;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

/// A stable identity for a (possibly pooled/reused) frame, used by
/// open upvalues to name "the register slot they were captured from"
/// without holding a raw pointer into a frame window that may be
/// recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

#[derive(Debug, Clone, Copy)]
pub struct ObjRange {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ObjRangeIterator {
    pub current: i64,
    pub end: i64,
    pub step: i64,
}

#[derive(Debug)]
pub struct ObjArrayIterator {
    pub array: Gc,
    pub index: usize,
}

#[derive(Debug)]
pub struct ObjClosure {
    pub function_index: u32,
    pub upvalues: Vec<Gc>,
}

/// The state of an upvalue: open (still reading through the owning
/// frame's live register) or closed (copied out when the frame died).
#[derive(Debug, Clone)]
pub enum UpvalueState {
    Open { frame: FrameId, register: RegisterId },
    Closed(Value),
}

#[derive(Debug)]
pub enum ObjPayload {
    String(String),
    Array(RefCell<Vec<Value>>),
    Range(ObjRange),
    RangeIterator(Cell<ObjRangeIterator>),
    ArrayIterator(RefCell<ObjArrayIterator>),
    Closure(ObjClosure),
    Upvalue(RefCell<UpvalueState>),
    Error(RuntimeError),
}

#[derive(Debug)]
struct GcHeader {
    marked: Cell<bool>,
}

#[derive(Debug)]
struct GcBox {
    header: GcHeader,
    payload: ObjPayload,
}

/// A non-owning handle to a heap object. Copy, like a pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Gc(NonNull<()>);

impl Gc {
    fn from_box(b: &Box<GcBox>) -> Self {
        Gc(NonNull::from(b.as_ref()).cast())
    }

    fn as_gcbox(&self) -> &GcBox {
        // SAFETY: see module-level safety contract. Internal callers
        // only ever hand out `Gc`s that are currently reachable from a
        // live `Heap`, and this runtime never runs a collection
        // concurrently with interpreter execution.
        unsafe { self.0.cast::<GcBox>().as_ref() }
    }

    pub fn payload(&self) -> &ObjPayload {
        &self.as_gcbox().payload
    }
}

pub struct Heap {
    objects: Vec<Box<GcBox>>,
    bytes_allocated: usize,
    gc_threshold: usize,
    gc_paused: bool,
    next_frame_id: u64,
}

impl Heap {
    pub fn new(gc_threshold: usize) -> Self {
        Self {
            objects: Vec::new(),
            bytes_allocated: 0,
            gc_threshold,
            gc_paused: false,
            next_frame_id: 0,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn gc_threshold(&self) -> usize {
        self.gc_threshold
    }

    pub fn set_gc_threshold(&mut self, threshold: usize) {
        self.gc_threshold = threshold;
    }

    /// Whether allocation/safepoints should trigger a collection right
    /// now.
    pub fn should_collect(&self) -> bool {
        !self.gc_paused && self.bytes_allocated > self.gc_threshold
    }

    pub fn pause(&mut self) {
        self.gc_paused = true;
    }

    pub fn resume(&mut self) {
        self.gc_paused = false;
    }

    pub fn gc_paused(&self) -> bool {
        self.gc_paused
    }

    pub fn next_frame_id(&mut self) -> FrameId {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        FrameId(id)
    }

    fn push(&mut self, payload: ObjPayload, size_estimate: usize) -> Gc {
        let b = Box::new(GcBox {
            header: GcHeader {
                marked: Cell::new(false),
            },
            payload,
        });
        self.bytes_allocated += size_estimate;
        let gc = Gc::from_box(&b);
        self.objects.push(b);
        gc
    }

    pub fn alloc_string(&mut self, s: String) -> Gc {
        let size = std::mem::size_of::<String>() + s.len();
        self.push(ObjPayload::String(s), size)
    }

    pub fn alloc_array(&mut self, values: Vec<Value>) -> Gc {
        let size = std::mem::size_of::<Value>() * values.len();
        self.push(ObjPayload::Array(RefCell::new(values)), size)
    }

    pub fn alloc_range(&mut self, range: ObjRange) -> Gc {
        self.push(ObjPayload::Range(range), std::mem::size_of::<ObjRange>())
    }

    pub fn alloc_range_iterator(&mut self, it: ObjRangeIterator) -> Gc {
        self.push(
            ObjPayload::RangeIterator(Cell::new(it)),
            std::mem::size_of::<ObjRangeIterator>(),
        )
    }

    pub fn alloc_array_iterator(&mut self, it: ObjArrayIterator) -> Gc {
        self.push(
            ObjPayload::ArrayIterator(RefCell::new(it)),
            std::mem::size_of::<ObjArrayIterator>(),
        )
    }

    pub fn alloc_closure(&mut self, closure: ObjClosure) -> Gc {
        let size = std::mem::size_of::<ObjClosure>() + closure.upvalues.len() * 8;
        self.push(ObjPayload::Closure(closure), size)
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState) -> Gc {
        self.push(
            ObjPayload::Upvalue(RefCell::new(state)),
            std::mem::size_of::<UpvalueState>(),
        )
    }

    pub fn alloc_error(&mut self, err: RuntimeError) -> Gc {
        let size = std::mem::size_of::<RuntimeError>() + err.message.len();
        self.push(ObjPayload::Error(err), size)
    }

    fn mark(&self, gc: Gc) {
        let gcbox = gc.as_gcbox();
        if gcbox.header.marked.replace(true) {
            return; // already marked; avoid re-walking cycles
        }
        match &gcbox.payload {
            ObjPayload::Array(values) => {
                for v in values.borrow().iter() {
                    if let Some(child) = v.as_gc() {
                        self.mark(child);
                    }
                }
            }
            ObjPayload::ArrayIterator(it) => self.mark(it.borrow().array),
            ObjPayload::Closure(c) => {
                for uv in &c.upvalues {
                    self.mark(*uv);
                }
            }
            ObjPayload::Upvalue(state) => {
                if let UpvalueState::Closed(v) = &*state.borrow() {
                    if let Some(child) = v.as_gc() {
                        self.mark(child);
                    }
                }
            }
            ObjPayload::String(_)
            | ObjPayload::Range(_)
            | ObjPayload::RangeIterator(_)
            | ObjPayload::Error(_) => {}
        }
    }

    /// Run a full mark-sweep collection. `roots` enumerates every
    /// live [`Value`]: boxed globals, every reconciled live register
    /// slot across the frame stack, every spill slot, every open
    /// upvalue, the current error, and VM scratch registers. Returns
    /// the number of objects freed.
    pub fn collect<I: IntoIterator<Item = Value>>(&mut self, roots: I) -> usize {
        if self.gc_paused {
            return 0;
        }
        for root in roots {
            if let Some(gc) = root.as_gc() {
                self.mark(gc);
            }
        }
        let before = self.objects.len();
        let mut freed_bytes = 0usize;
        self.objects.retain(|b| {
            let keep = b.header.marked.replace(false);
            if !keep {
                freed_bytes += estimate_size(&b.payload);
            }
            keep
        });
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        before - self.objects.len()
    }
}

fn estimate_size(payload: &ObjPayload) -> usize {
    match payload {
        ObjPayload::String(s) => std::mem::size_of::<String>() + s.len(),
        ObjPayload::Array(v) => std::mem::size_of::<Value>() * v.borrow().len(),
        ObjPayload::Range(_) => std::mem::size_of::<ObjRange>(),
        ObjPayload::RangeIterator(_) => std::mem::size_of::<ObjRangeIterator>(),
        ObjPayload::ArrayIterator(_) => std::mem::size_of::<ObjArrayIterator>(),
        ObjPayload::Closure(c) => std::mem::size_of::<ObjClosure>() + c.upvalues.len() * 8,
        ObjPayload::Upvalue(_) => std::mem::size_of::<UpvalueState>(),
        ObjPayload::Error(e) => std::mem::size_of::<RuntimeError>() + e.message.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RuntimeErrorKind, SourceLocation};

    #[test]
    fn unreachable_string_is_collected() {
        let mut heap = Heap::new(0);
        let _dead = heap.alloc_string("gone".into());
        let live = heap.alloc_string("kept".into());
        let freed = heap.collect([Value::String(live)]);
        assert_eq!(freed, 1);
        assert_eq!(heap.objects.len(), 1);
    }

    #[test]
    fn array_keeps_its_elements_alive() {
        let mut heap = Heap::new(0);
        let inner = heap.alloc_string("inner".into());
        let arr = heap.alloc_array(vec![Value::String(inner)]);
        let freed = heap.collect([Value::Array(arr)]);
        assert_eq!(freed, 0);
    }

    #[test]
    fn closed_upvalue_over_a_string_keeps_it_alive() {
        let mut heap = Heap::new(0);
        let s = heap.alloc_string("captured".into());
        let uv = heap.alloc_upvalue(UpvalueState::Closed(Value::String(s)));
        let freed = heap.collect([Value::Upvalue(uv)]);
        assert_eq!(freed, 0);
    }

    #[test]
    fn gc_paused_collects_nothing() {
        let mut heap = Heap::new(0);
        heap.pause();
        let _dead = heap.alloc_string("gone".into());
        let freed = heap.collect(std::iter::empty());
        assert_eq!(freed, 0);
    }

    #[test]
    fn error_value_as_root_is_preserved() {
        let mut heap = Heap::new(0);
        let err = heap.alloc_error(RuntimeError::new(
            RuntimeErrorKind::Runtime,
            "boom",
            SourceLocation::SYNTHETIC,
        ));
        let freed = heap.collect([Value::Error(err)]);
        assert_eq!(freed, 0);
    }

    // Generalizes `unreachable_string_is_collected` and
    // `array_keeps_its_elements_alive`: for any number of allocated
    // strings and any subset of them threaded into a rooted array, a
    // collection keeps exactly that subset plus the array itself and
    // frees the rest, regardless of which indices were kept.
    #[quickcheck_macros::quickcheck]
    fn only_strings_reachable_through_a_rooted_array_survive(n: u8, keep_mask: u16) -> bool {
        let n = (n % 12) as usize + 1;
        let mut heap = Heap::new(0);
        let mut kept = Vec::new();
        let mut kept_count = 0usize;
        for i in 0..n {
            let s = heap.alloc_string(format!("s{i}"));
            if keep_mask & (1 << (i % 16)) != 0 {
                kept.push(Value::String(s));
                kept_count += 1;
            }
        }
        let arr = heap.alloc_array(kept);
        let freed = heap.collect([Value::Array(arr)]);
        freed == n - kept_count && heap.objects.len() == 1 + kept_count
    }
}
