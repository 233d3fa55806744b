//! The native-code cache: one compiled entry per `(function,
//! loop_offset)` that tier-up has installed, plus the rolling
//! translate-failure log and deopt/compilation counters used for
//! diagnostics.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::jit::backend::NativeEntry;
use crate::jit::translate::TranslateStatus;

const FAILURE_LOG_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LoopKey {
    func: usize,
    loop_offset: usize,
}

/// A function's current execution tier (spec.md §4.10): `Baseline`
/// runs the function's plain chunk; `Specialized` runs a chunk with a
/// parameter-kind guard prelude ahead of the same body. A guard
/// failure demotes the function back to `Baseline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Baseline,
    Specialized,
}

#[derive(Debug, Default)]
pub struct TieringTable {
    entries: HashMap<LoopKey, NativeEntry>,
    specialized: HashMap<usize, Chunk>,
    translate_failures: Vec<TranslateStatus>,
    translate_failure_counts: HashMap<TranslateStatus, u64>,
    jit_compilation_count: u64,
    jit_deopt_count: u64,
    jit_native_type_deopts: u64,
    jit_function_deopt_count: u64,
}

impl TieringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, func: usize, loop_offset: usize) -> Option<&NativeEntry> {
        self.entries.get(&LoopKey { func, loop_offset })
    }

    pub fn install(&mut self, func: usize, loop_offset: usize, entry: NativeEntry) {
        self.entries.insert(LoopKey { func, loop_offset }, entry);
        self.jit_compilation_count += 1;
    }

    /// Evict a loop from the native cache (a type-guard failure during
    /// replay, or any other reason the cached entry is no longer
    /// trustworthy).
    pub fn invalidate(&mut self, func: usize, loop_offset: usize) {
        self.entries.remove(&LoopKey { func, loop_offset });
    }

    pub fn record_translate_failure(&mut self, status: TranslateStatus) {
        if self.translate_failures.len() == FAILURE_LOG_CAPACITY {
            self.translate_failures.remove(0);
        }
        self.translate_failures.push(status);
        *self.translate_failure_counts.entry(status).or_insert(0) += 1;
    }

    /// A native replay hit a type guard and fell back to the baseline
    /// interpreter.
    pub fn record_type_deopt(&mut self) {
        self.jit_deopt_count += 1;
        self.jit_native_type_deopts += 1;
    }

    pub fn jit_compilation_count(&self) -> u64 {
        self.jit_compilation_count
    }

    pub fn jit_deopt_count(&self) -> u64 {
        self.jit_deopt_count
    }

    pub fn jit_native_type_deopts(&self) -> u64 {
        self.jit_native_type_deopts
    }

    pub fn translate_failure_count(&self, status: TranslateStatus) -> u64 {
        self.translate_failure_counts.get(&status).copied().unwrap_or(0)
    }

    /// Install a specialized chunk for `func`, promoting it to
    /// [`Tier::Specialized`].
    pub fn install_specialized(&mut self, func: usize, chunk: Chunk) {
        self.specialized.insert(func, chunk);
    }

    pub fn tier(&self, func: usize) -> Tier {
        if self.specialized.contains_key(&func) {
            Tier::Specialized
        } else {
            Tier::Baseline
        }
    }

    pub fn specialized_chunk(&self, func: usize) -> Option<&Chunk> {
        self.specialized.get(&func)
    }

    /// A parameter guard in `func`'s specialized chunk failed: drop
    /// the specialized chunk and demote `func` back to baseline.
    pub fn deopt_specialized(&mut self, func: usize) {
        if self.specialized.remove(&func).is_some() {
            self.jit_deopt_count += 1;
            self.jit_function_deopt_count += 1;
        }
    }

    pub fn jit_function_deopt_count(&self) -> u64 {
        self.jit_function_deopt_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkBuilder;
    use crate::jit::backend::BackendKind;
    use crate::jit::ir::Program;

    fn dummy_entry() -> NativeEntry {
        NativeEntry {
            backend: BackendKind::Native,
            program: Program { func: 0, loop_offset: 10, nodes: vec![] },
        }
    }

    #[test]
    fn install_then_lookup_round_trips_and_counts_compilation() {
        let mut t = TieringTable::new();
        t.install(0, 10, dummy_entry());
        assert!(t.lookup(0, 10).is_some());
        assert_eq!(t.jit_compilation_count(), 1);
    }

    #[test]
    fn invalidate_evicts_a_cache_hit() {
        let mut t = TieringTable::new();
        t.install(0, 10, dummy_entry());
        t.invalidate(0, 10);
        assert!(t.lookup(0, 10).is_none());
    }

    #[test]
    fn translate_failures_are_counted_per_status() {
        let mut t = TieringTable::new();
        t.record_translate_failure(TranslateStatus::RolloutDisabled);
        t.record_translate_failure(TranslateStatus::RolloutDisabled);
        t.record_translate_failure(TranslateStatus::UnsupportedOpcode);
        assert_eq!(t.translate_failure_count(TranslateStatus::RolloutDisabled), 2);
        assert_eq!(t.translate_failure_count(TranslateStatus::UnsupportedOpcode), 1);
    }

    #[test]
    fn type_deopt_bumps_both_counters() {
        let mut t = TieringTable::new();
        t.record_type_deopt();
        assert_eq!(t.jit_deopt_count(), 1);
        assert_eq!(t.jit_native_type_deopts(), 1);
    }

    #[test]
    fn installing_a_specialized_chunk_promotes_the_tier() {
        let mut t = TieringTable::new();
        assert_eq!(t.tier(3), Tier::Baseline);
        t.install_specialized(3, ChunkBuilder::new().finish());
        assert_eq!(t.tier(3), Tier::Specialized);
        assert!(t.specialized_chunk(3).is_some());
    }

    #[test]
    fn deopt_specialized_demotes_the_tier_and_counts_it() {
        let mut t = TieringTable::new();
        t.install_specialized(3, ChunkBuilder::new().finish());
        t.deopt_specialized(3);
        assert_eq!(t.tier(3), Tier::Baseline);
        assert!(t.specialized_chunk(3).is_none());
        assert_eq!(t.jit_function_deopt_count(), 1);
        assert_eq!(t.jit_deopt_count(), 1);
    }

    #[test]
    fn deopt_on_a_baseline_function_is_a_no_op() {
        let mut t = TieringTable::new();
        t.deopt_specialized(3);
        assert_eq!(t.jit_function_deopt_count(), 0);
        assert_eq!(t.jit_deopt_count(), 0);
    }
}
