//! Runtime error codes and the VM error type.
//!
//! `ErrorCode` is the flat enumeration hosts see through the error hook;
//! the three stack-trace codes only ever appear there, bracketing the
//! per-frame reports emitted while a runtime error unwinds.

use thiserror::Error;

/// Host-visible error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    /// Retained for host-visible allocation failures; Rust's allocator
    /// aborts on true exhaustion, so this never originates in the heap.
    OutOfMemory,
    Runtime,
    Lexer,
    Compile,
    FnArityMismatch,
    ModuleAlreadyDefined,
    ModuleNotFound,
    InvalidOpOnType,
    InvalidArgument,
    /// Start of a synthetic stack trace (error hook only).
    StackTraceBegin,
    /// One popped frame of a stack trace (error hook only).
    StackTraceFrame,
    /// End of a synthetic stack trace (error hook only).
    StackTraceEnd,
}

/// An error surfaced by a VM entry point.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct VmError {
    pub code: ErrorCode,
    /// 1-based source line where the error was raised; 0 when unknown.
    pub line: u32,
    pub message: String,
}

impl VmError {
    pub fn new(code: ErrorCode, line: u32, message: impl Into<String>) -> Self {
        VmError {
            code,
            line,
            message: message.into(),
        }
    }
}
