//! Source positions.
//!
//! The parser is an external collaborator; the AST it hands over carries
//! [`Token`]s so the compiler can attach positions to diagnostics and the
//! line table.

use std::fmt;

/// An identifier-ish token from the parsed source: its text plus the line it
/// appeared on. Literal payloads are pre-parsed into the AST, so the token
/// only exists for naming and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The lexeme text.
    pub name: String,
    /// 0-based source line.
    pub line: u32,
}

impl Token {
    /// Create a token.
    #[must_use]
    pub fn new(name: impl Into<String>, line: u32) -> Self {
        Self {
            name: name.into(),
            line,
        }
    }

    /// A compiler-fabricated token with no real source position. Used for
    /// implicit names such as `this`.
    #[must_use]
    pub fn synthetic(name: impl Into<String>) -> Self {
        Self::new(name, 0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
