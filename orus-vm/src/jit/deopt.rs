//! The deopt landing pad: what a native trace's type-guard failure
//! hands back to the interpreter.
//!
//! A trace is speculated against the counter/limit kinds observed at
//! translation time. If a later iteration's registers disagree (a
//! register the trace assumed `I32` now holds something else), the
//! replay executor aborts the trace rather than guess: the active
//! frame's typed window is metadata-cleared for every local/temp slot,
//! execution resumes at the bytecode offset the failing IR node came
//! from, and the loop is evicted from the native cache so it never
//! retraces against a now-stale observation.

use crate::register::GLOBAL_BAND_SIZE;
use std::ops::Range;

/// The frame-relative register range a deopt must metadata-clear:
/// every parameter/local/temp slot. The global band is never
/// trace-specialized and is left untouched.
pub fn frame_clear_range(register_count: u16, temp_count: u16) -> Range<u16> {
    GLOBAL_BAND_SIZE..(GLOBAL_BAND_SIZE + register_count + temp_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_range_spans_locals_and_temps_but_not_globals() {
        let r = frame_clear_range(4, 2);
        assert_eq!(r, GLOBAL_BAND_SIZE..GLOBAL_BAND_SIZE + 6);
    }

    #[test]
    fn clear_range_is_empty_for_a_frame_with_no_locals() {
        let r = frame_clear_range(0, 0);
        assert_eq!(r.start, r.end);
    }
}
