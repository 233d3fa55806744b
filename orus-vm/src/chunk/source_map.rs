//! Parallel source-location tracking for a chunk's instruction stream.
//!
//! Entries are recorded once per emitted instruction, at the offset of
//! its opcode byte, and sorted by construction (emission is
//! append-only until the chunk is frozen). Lookups fall back to the
//! nearest preceding entry, and entries for a deleted byte range are
//! dropped coherently by [`SourceMap::delete_range`] (used by the
//! peephole pass).

use crate::error::SourceLocation;

#[derive(Debug, Clone)]
struct Entry {
    offset: usize,
    location: SourceLocation,
}

#[derive(Debug, Default)]
pub struct SourceMap {
    entries: Vec<Entry>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the source location of the instruction beginning at
    /// `offset`. Callers must record offsets in non-decreasing order.
    pub fn record(&mut self, offset: usize, location: SourceLocation) {
        debug_assert!(self.entries.last().map(|e| e.offset <= offset).unwrap_or(true));
        self.entries.push(Entry { offset, location });
    }

    /// The source location attributed to `offset`: an exact match if
    /// one was recorded, otherwise the nearest preceding instruction's
    /// location. Offsets before the first recorded entry (e.g. a
    /// synthetic prologue) yield [`SourceLocation::SYNTHETIC`].
    pub fn location_at(&self, offset: usize) -> SourceLocation {
        match self.entries.binary_search_by_key(&offset, |e| e.offset) {
            Ok(i) => self.entries[i].location.clone(),
            Err(0) => SourceLocation::SYNTHETIC,
            Err(i) => self.entries[i - 1].location.clone(),
        }
    }

    /// Delete every entry whose offset falls inside `removed`, and
    /// shift every entry after it left by the range's length, keeping
    /// the map coherent with a peephole deletion of those bytes.
    pub fn delete_range(&mut self, removed: std::ops::Range<usize>) {
        let shift = removed.end - removed.start;
        self.entries.retain(|e| !removed.contains(&e.offset));
        for e in &mut self.entries {
            if e.offset >= removed.end {
                e.offset -= shift;
            }
        }
    }

    /// Append another map's entries, each offset by `bias`. Used when
    /// splicing an existing chunk's body behind a freshly emitted
    /// prelude: `bias` is the prelude's byte length.
    pub fn append_shifted(&mut self, other: &SourceMap, bias: usize) {
        self.entries.extend(other.entries.iter().map(|e| Entry {
            offset: e.offset + bias,
            location: e.location.clone(),
        }));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
