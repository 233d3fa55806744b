//! Error surface of the VM.
//!
//! Two distinct error universes live in this crate and must not be
//! conflated:
//!
//! - [`OrusError`]: a `Result`-level error for internal failures (OOM,
//!   malformed input from the bytecode producer, broken invariants).
//!   These never reach a running Orus program.
//! - [`RuntimeErrorKind`] + [`Value::Error`](crate::value::Value): a
//!   VM-observable error value, set on `vm.last_error` and surfaced via
//!   `InterpretResult::RuntimeError`. A `try` block in bytecode can
//!   catch these.

use std::fmt;

/// Internal, non-recoverable-by-the-VM-program failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OrusError {
    #[error("out of memory: failed to grow {what} (requested {requested} bytes)")]
    OutOfMemory { what: &'static str, requested: usize },

    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("constant pool index {index} out of range (pool has {len} entries)")]
    ConstantOutOfRange { index: u16, len: usize },

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

pub type OrusResult<T> = Result<T, OrusError>;

/// The kind of a VM-level runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum RuntimeErrorKind {
    Value,
    Type,
    Name,
    Import,
    Runtime,
}

/// Source location attached to a runtime error, taken from the chunk's
/// source map at the failing instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: i32,
    pub column: i32,
}

impl SourceLocation {
    /// The sentinel location used for synthetic instructions (emitted
    /// `HALT`, padding) that have no corresponding source position.
    pub const SYNTHETIC: SourceLocation = SourceLocation {
        file: None,
        line: -1,
        column: -1,
    };
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}:{}:{}", self.line, self.column),
            None => write!(f, "<synthetic>"),
        }
    }
}

/// A runtime error value, surfaced to running bytecode.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub location: SourceLocation,
}

impl RuntimeError {
    pub fn new(
        kind: RuntimeErrorKind,
        message: impl Into<String>,
        location: SourceLocation,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            location,
        }
    }

    pub fn overflow(location: SourceLocation) -> Self {
        Self::new(RuntimeErrorKind::Value, "integer overflow", location)
    }

    pub fn div_by_zero(location: SourceLocation) -> Self {
        Self::new(RuntimeErrorKind::Value, "division by zero", location)
    }

    pub fn type_mismatch(expected: &str, location: SourceLocation) -> Self {
        Self::new(
            RuntimeErrorKind::Type,
            format!("expected a value of type {expected}"),
            location,
        )
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (at {})", self.kind, self.message, self.location)
    }
}

/// The result of running a chunk to completion or exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}
