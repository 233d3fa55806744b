//! Backend selection: decides whether a translated [`Program`] can run
//! on the native path or only through the helper-stub path, and
//! packages the result as a [`NativeEntry`] for the tiering cache.
//!
//! Both backends execute the same IR through [`crate::dispatch::Vm`]'s
//! private replay executor; what differs is which IR nodes each one
//! accepts. `Native` refuses [`crate::jit::ir::IrOp::HelperArith`]
//! (wide-int/float division and modulo) the way a real native emitter
//! would refuse to inline a libcall; `HelperStub` accepts everything,
//! trading that generality for being unconditionally correct.

use crate::config::{JitBackendKind, VmConfig};
use crate::jit::ir::Program;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CompileStatus {
    /// The program needs the helper-stub path but the selected backend
    /// was pinned to native (or Auto refuses to silently downgrade).
    UnsupportedArithmetic,
    /// Nothing to compile (an empty linear block).
    EmptyProgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum BackendKind {
    Native,
    HelperStub,
}

/// A cached compiled entry: which backend accepted the program, and
/// the program itself for the replay executor to run.
#[derive(Debug, Clone)]
pub struct NativeEntry {
    pub backend: BackendKind,
    pub program: Program,
}

pub fn compile_ir(program: &Program, config: &VmConfig) -> Result<NativeEntry, CompileStatus> {
    if program.nodes.is_empty() {
        return Err(CompileStatus::EmptyProgram);
    }
    let wants_helper_stub = program.requires_helper_stub();
    match config.jit_backend {
        JitBackendKind::ForceHelperStub => Ok(NativeEntry {
            backend: BackendKind::HelperStub,
            program: program.clone(),
        }),
        JitBackendKind::ForceDynasm | JitBackendKind::Auto => {
            if wants_helper_stub {
                // Per the rollout's failure taxonomy: a program that
                // only a helper stub could run is never installed as a
                // native cache hit, even though a stub trampoline
                // could technically execute it. The caller blocklists.
                Err(CompileStatus::UnsupportedArithmetic)
            } else {
                Ok(NativeEntry {
                    backend: BackendKind::Native,
                    program: program.clone(),
                })
            }
        }
    }
}
