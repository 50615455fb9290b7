//! Compile-time diagnostics.
//!
//! The parser records an error, skips to the next `;` (or end of input) and
//! keeps going, so one compile can surface several diagnostics. Lexer
//! errors flow into the same list.

use std::fmt;
use thiserror::Error;

/// A single line-stamped diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct CompileError {
    /// 1-based source line.
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        CompileError {
            line,
            message: message.into(),
        }
    }
}

/// Every diagnostic from one compile, in source order.
#[derive(Debug, Clone, Error)]
pub struct CompileErrors(pub Vec<CompileError>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
