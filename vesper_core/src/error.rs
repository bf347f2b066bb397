//! Error types for compilation and execution.
//!
//! Compile-time diagnostics carry the offending token and keep flowing into
//! the error sink so one run reports many errors. Runtime errors carry a
//! numeric code naming the category; the dispatch loop surfaces them through
//! an explicit `Result` channel and the driver prints a stack trace.

use crate::span::Token;
use std::fmt;
use thiserror::Error;

/// Category codes for runtime errors. The numeric values are part of the
/// engine's observable behavior (they become the process exit code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuntimeErrorCode {
    /// Value stack or call frame stack exhausted.
    StackOverflow = 1,
    /// Wrong number of arguments for a call.
    Arity = 2,
    /// Operand or receiver of the wrong type.
    Type = 3,
    /// Field or method not found.
    MissingMember = 4,
    /// Malformed opcode argument in the instruction stream.
    MalformedOpcode = 6,
    /// Index outside an array's bounds.
    OutOfBounds = 9,
}

impl RuntimeErrorCode {
    /// The numeric code.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for RuntimeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A runtime error unwinding out of the dispatch loop.
#[derive(Error, Debug, Clone)]
#[error("Runtime error: {message}")]
pub struct RuntimeError {
    /// Error category.
    pub code: RuntimeErrorCode,
    /// Formatted description.
    pub message: String,
}

impl RuntimeError {
    /// Create a runtime error.
    #[must_use]
    pub fn new(code: RuntimeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A compile-time diagnostic attached to a source token.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// Description of the problem.
    pub message: String,
    /// The offending token, when one exists. System errors (constant pool
    /// overflow, too many locals) may not have a useful token.
    pub token: Option<Token>,
    /// Module file name the diagnostic belongs to.
    pub file: String,
}

impl CompileError {
    /// Diagnostic anchored at a token.
    #[must_use]
    pub fn at(token: Token, file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            token: Some(token),
            file: file.into(),
        }
    }

    /// System error with no token.
    #[must_use]
    pub fn system(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            token: None,
            file: file.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(tok) => write!(
                f,
                "{}:{}: error at '{}': {}",
                self.file,
                tok.line + 1,
                tok.name,
                self.message
            ),
            None => write!(f, "{}: error: {}", self.file, self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Top-level failure of the engine entry point.
#[derive(Error, Debug)]
pub enum VesperError {
    /// One or more compile diagnostics.
    #[error("{} compile error(s)", .0.len())]
    Compile(Vec<CompileError>),
    /// A runtime error that unwound the main thread.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_codes_match_taxonomy() {
        assert_eq!(RuntimeErrorCode::StackOverflow.as_u8(), 1);
        assert_eq!(RuntimeErrorCode::Arity.as_u8(), 2);
        assert_eq!(RuntimeErrorCode::Type.as_u8(), 3);
        assert_eq!(RuntimeErrorCode::MissingMember.as_u8(), 4);
        assert_eq!(RuntimeErrorCode::MalformedOpcode.as_u8(), 6);
        assert_eq!(RuntimeErrorCode::OutOfBounds.as_u8(), 9);
    }

    #[test]
    fn compile_error_display_includes_position() {
        let err = CompileError::at(Token::new("x", 4), "main.vsp", "undeclared variable");
        let text = err.to_string();
        assert!(text.contains("main.vsp:5"));
        assert!(text.contains("'x'"));
    }

    #[test]
    fn system_error_display_has_no_token() {
        let err = CompileError::system("main.vsp", "too many constants");
        assert_eq!(err.to_string(), "main.vsp: error: too many constants");
    }

    #[test]
    fn runtime_error_display() {
        let err = RuntimeError::new(RuntimeErrorCode::Type, "operand must be a number");
        assert!(err.to_string().contains("operand must be a number"));
    }
}
