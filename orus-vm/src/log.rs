//! Diagnostic logging.
//!
//! Developer-facing JIT state prints are gated behind an environment
//! variable read once via a lazily initialised static, and routed
//! through `tracing` so an embedder can install any subscriber it
//! likes instead of getting raw `eprintln!` output.

use std::sync::OnceLock;

/// Emit a structured event describing a JIT lifecycle transition:
/// tier-up attempts, deopts, translation bailouts. Cheap when no
/// subscriber is installed (tracing's macros no-op at the callsite).
macro_rules! jit_event {
    ($($arg:tt)*) => {
        tracing::event!(tracing::Level::DEBUG, $($arg)*)
    };
}
pub(crate) use jit_event;

fn jitstate_debug_enabled() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| std::env::var("ORUS_JIT_BACKEND_TEST_DEBUG").is_ok())
}

/// Print a one-line JIT state transition to stderr when
/// `ORUS_JIT_BACKEND_TEST_DEBUG` is set, in addition to the
/// always-on `tracing` event. Intended for ad hoc debugging sessions,
/// not for production log consumption.
pub fn print_jit_state(state: &str) {
    tracing::debug!(target: "orus_vm::jit", state, "jit state transition");
    if jitstate_debug_enabled() {
        eprintln!("jit-state: {state}");
    }
}
