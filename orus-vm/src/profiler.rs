//! Hot-path sampling and the tier-up gate.
//!
//! A fixed-size table of per-(function, loop) hit counters. Crossing
//! `HOT_THRESHOLD` triggers exactly one tier-up attempt; a loop that
//! has already been blocklisted (a prior translate/compile failure)
//! or already has a native cache entry never resamples.

use std::collections::HashMap;

/// The hit-count threshold past which a loop is considered hot enough
/// to attempt a tier-up. Plain `u32`: this is a counter compared once
/// per back-edge, not a type that needs its own invariants.
pub type HotThreshold = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LoopKey {
    func: usize,
    loop_offset: usize,
}

/// Sentinel `loop_offset` used to key a function's call-hotness sample
/// rather than a loop's back-edge sample, under the same table. No
/// real bytecode offset can equal `usize::MAX`, so the two sample
/// kinds never collide.
const FUNCTION_ENTRY: usize = usize::MAX;

#[derive(Debug, Default)]
struct Sample {
    hit_count: u32,
    attempted: bool,
    blocklisted: bool,
}

/// What [`Profiler::record_back_edge`] tells the dispatcher to do
/// about the back-edge it just observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierUpDecision {
    /// Stay in the interpreter; the loop isn't hot yet, is already
    /// installed, or is blocklisted.
    KeepInterpreting,
    /// Crossed the threshold for the first time: attempt translation
    /// and compilation exactly once.
    AttemptTierUp,
}

#[derive(Debug)]
pub struct Profiler {
    hot_threshold: HotThreshold,
    samples: HashMap<LoopKey, Sample>,
}

impl Profiler {
    pub fn new(hot_threshold: HotThreshold) -> Self {
        Self {
            hot_threshold,
            samples: HashMap::new(),
        }
    }

    /// Bump the hit counter for `(func, loop_offset)` and decide
    /// whether this is the back-edge that should trigger a tier-up
    /// attempt.
    pub fn record_back_edge(&mut self, func: usize, loop_offset: usize) -> TierUpDecision {
        let key = LoopKey { func, loop_offset };
        let sample = self.samples.entry(key).or_default();
        if sample.blocklisted || sample.attempted {
            return TierUpDecision::KeepInterpreting;
        }
        sample.hit_count += 1;
        if sample.hit_count >= self.hot_threshold {
            sample.attempted = true;
            TierUpDecision::AttemptTierUp
        } else {
            TierUpDecision::KeepInterpreting
        }
    }

    /// Record that tier-up for `(func, loop_offset)` failed (a
    /// translation bailout that isn't rollout-gated, or a compile
    /// failure): never attempt again.
    pub fn blocklist(&mut self, func: usize, loop_offset: usize) {
        let key = LoopKey { func, loop_offset };
        self.samples.entry(key).or_default().blocklisted = true;
    }

    pub fn is_blocklisted(&self, func: usize, loop_offset: usize) -> bool {
        self.samples
            .get(&LoopKey { func, loop_offset })
            .map(|s| s.blocklisted)
            .unwrap_or(false)
    }

    pub fn hit_count(&self, func: usize, loop_offset: usize) -> u32 {
        self.samples
            .get(&LoopKey { func, loop_offset })
            .map(|s| s.hit_count)
            .unwrap_or(0)
    }

    /// Bump `func`'s call-hotness counter, reusing the loop sample
    /// table under the [`FUNCTION_ENTRY`] sentinel offset. A function
    /// crossing the threshold is a candidate for compile-time
    /// specialization rather than loop tier-up.
    pub fn record_call(&mut self, func: usize) -> TierUpDecision {
        self.record_back_edge(func, FUNCTION_ENTRY)
    }

    /// A specialized chunk for `func` failed its parameter guard (or
    /// specialization itself failed to build): never attempt again.
    pub fn blocklist_specialization(&mut self, func: usize) {
        self.blocklist(func, FUNCTION_ENTRY)
    }

    pub fn is_specialization_blocklisted(&self, func: usize) -> bool {
        self.is_blocklisted(func, FUNCTION_ENTRY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_threshold_triggers_exactly_one_attempt() {
        let mut p = Profiler::new(3);
        assert_eq!(p.record_back_edge(0, 10), TierUpDecision::KeepInterpreting);
        assert_eq!(p.record_back_edge(0, 10), TierUpDecision::KeepInterpreting);
        assert_eq!(p.record_back_edge(0, 10), TierUpDecision::AttemptTierUp);
        // Resampling after the attempt never fires again, success or not.
        assert_eq!(p.record_back_edge(0, 10), TierUpDecision::KeepInterpreting);
    }

    #[test]
    fn blocklisted_loop_never_resamples() {
        let mut p = Profiler::new(1);
        p.blocklist(0, 10);
        assert_eq!(p.record_back_edge(0, 10), TierUpDecision::KeepInterpreting);
        assert!(p.is_blocklisted(0, 10));
    }

    #[test]
    fn distinct_loops_track_independent_counters() {
        let mut p = Profiler::new(2);
        p.record_back_edge(0, 10);
        assert_eq!(p.hit_count(0, 10), 1);
        assert_eq!(p.hit_count(0, 20), 0);
    }

    #[test]
    fn call_hotness_is_independent_of_any_loop_in_the_same_function() {
        let mut p = Profiler::new(2);
        p.record_back_edge(0, 10);
        assert_eq!(p.record_call(0), TierUpDecision::KeepInterpreting);
        assert_eq!(p.record_call(0), TierUpDecision::AttemptTierUp);
        assert_eq!(p.hit_count(0, 10), 1);
    }

    #[test]
    fn blocklisting_specialization_never_resamples_that_function() {
        let mut p = Profiler::new(1);
        p.blocklist_specialization(2);
        assert_eq!(p.record_call(2), TierUpDecision::KeepInterpreting);
        assert!(p.is_specialization_blocklisted(2));
        assert!(!p.is_blocklisted(2, 10));
    }
}
