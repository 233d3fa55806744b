//! VM configuration.
//!
//! A builder with chained setters, consumed once to produce the
//! runtime object (here, a [`Vm`](crate::dispatch::Vm)). Environment
//! variable overrides are read once at build time, not re-read on the
//! hot path.

use crate::jit::rollout::RolloutStage;
use crate::profiler::HotThreshold;
use std::env;

const DEFAULT_HOT_THRESHOLD: HotThreshold = 50;
const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Which backend [`crate::jit::backend::compile_ir`] should prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitBackendKind {
    /// Pick the best available backend: native when the program is
    /// eligible, a helper stub when it needs Div/Mod on a wide int or
    /// float kind.
    Auto,
    /// Force the native backend, bypassing the helper-stub selection
    /// heuristic (`ORUS_JIT_FORCE_DYNASM`); a program that needs the
    /// helper stub still fails to compile rather than silently running
    /// on the wrong backend.
    ForceDynasm,
    /// Force every IR program through the helper-stub backend
    /// (`ORUS_JIT_FORCE_HELPER_STUB`).
    ForceHelperStub,
}

/// A one-shot snapshot of the environment variables that tune JIT
/// backend selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOverrides {
    pub force_helper_stub: bool,
    pub force_dynasm: bool,
}

impl EnvOverrides {
    pub fn from_process_env() -> Self {
        Self {
            force_helper_stub: env::var("ORUS_JIT_FORCE_HELPER_STUB").is_ok(),
            force_dynasm: env::var("ORUS_JIT_FORCE_DYNASM").is_ok(),
        }
    }
}

/// Immutable VM configuration, produced by [`VmConfigBuilder`].
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub hot_threshold: HotThreshold,
    pub gc_threshold: usize,
    pub rollout_stage: RolloutStage,
    pub jit_backend: JitBackendKind,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfigBuilder::new().build()
    }
}

/// Builder for [`VmConfig`].
pub struct VmConfigBuilder {
    hot_threshold: HotThreshold,
    gc_threshold: usize,
    rollout_stage: RolloutStage,
    jit_backend: JitBackendKind,
}

impl VmConfigBuilder {
    pub fn new() -> Self {
        Self {
            hot_threshold: DEFAULT_HOT_THRESHOLD,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            rollout_stage: RolloutStage::Strings,
            jit_backend: JitBackendKind::Auto,
        }
    }

    pub fn hot_threshold(mut self, hot_threshold: HotThreshold) -> Self {
        self.hot_threshold = hot_threshold;
        self
    }

    pub fn gc_threshold(mut self, gc_threshold: usize) -> Self {
        self.gc_threshold = gc_threshold;
        self
    }

    pub fn rollout_stage(mut self, stage: RolloutStage) -> Self {
        self.rollout_stage = stage;
        self
    }

    pub fn jit_backend(mut self, kind: JitBackendKind) -> Self {
        self.jit_backend = kind;
        self
    }

    /// Consume the builder, folding in environment overrides read from
    /// the process environment exactly once.
    pub fn build(self) -> VmConfig {
        let env = EnvOverrides::from_process_env();
        let jit_backend = if env.force_helper_stub {
            JitBackendKind::ForceHelperStub
        } else if env.force_dynasm {
            JitBackendKind::ForceDynasm
        } else {
            self.jit_backend
        };
        VmConfig {
            hot_threshold: self.hot_threshold,
            gc_threshold: self.gc_threshold,
            rollout_stage: self.rollout_stage,
            jit_backend,
        }
    }
}

impl Default for VmConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
