//! Spill area: a map from spill-ID (>= `SPILL_REG_START`) to a boxed
//! [`Value`], grown on demand. Spill slots are GC roots, so callers
//! must thread every live entry's value through
//! [`crate::heap::Heap::collect`]'s root iterator.

use crate::register::RegisterId;
use crate::value::Value;

#[derive(Debug, Default)]
pub struct SpillArea {
    slots: Vec<Option<Value>>,
    free_list: Vec<usize>,
}

impl SpillArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, value: Value) -> RegisterId {
        let idx = if let Some(idx) = self.free_list.pop() {
            self.slots[idx] = Some(value);
            idx
        } else {
            self.slots.push(Some(value));
            self.slots.len() - 1
        };
        RegisterId::spill_id(idx)
    }

    pub fn set(&mut self, id: RegisterId, value: Value) {
        let idx = id.spill_index();
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        self.slots[idx] = Some(value);
    }

    pub fn get(&self, id: RegisterId) -> Value {
        let idx = id.spill_index();
        self.slots
            .get(idx)
            .and_then(|s| *s)
            .expect("unspill of a never-written or already-removed spill slot")
    }

    pub fn remove(&mut self, id: RegisterId) {
        let idx = id.spill_index();
        if idx < self.slots.len() {
            self.slots[idx] = None;
            self.free_list.push(idx);
        }
    }

    /// Every currently occupied spill slot's value, for GC rooting.
    pub fn live_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().filter_map(|s| *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_set_unspill_roundtrip() {
        let mut spill = SpillArea::new();
        let id = spill.allocate(Value::I32(9));
        assert_eq!(spill.get(id), Value::I32(9));
        spill.set(id, Value::I32(10));
        assert_eq!(spill.get(id), Value::I32(10));
        spill.remove(id);
    }

    #[test]
    fn removed_slot_is_recycled() {
        let mut spill = SpillArea::new();
        let a = spill.allocate(Value::I32(1));
        spill.remove(a);
        let b = spill.allocate(Value::I32(2));
        assert_eq!(a, b);
    }
}
