//! Orus VM execution core: a register-based bytecode interpreter with
//! a profiler-driven baseline JIT tier.
//!
//! [`dispatch::Vm`] is the entry point. Construct one from a set of
//! [`dispatch::FunctionProto`]s and [`dispatch::NativeFn`]s, plus a
//! [`config::VmConfig`], and call [`dispatch::Vm::run`].

pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod heap;
pub mod jit;
pub mod log;
pub mod peephole;
pub mod profiler;
pub mod register;
pub mod tiering;
pub mod value;

pub use dispatch::{FunctionProto, NativeFn, Vm};
pub use error::{InterpretResult, OrusError, OrusResult, RuntimeError, RuntimeErrorKind};
pub use value::{Value, ValueKind};
