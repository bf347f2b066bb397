//! # Vesper Core
//!
//! Core types shared across all Vesper components:
//!
//! - **Value System**: NaN-boxed 64-bit representation of Vesper values
//! - **Spans**: source positions and tokens carried by the parsed AST
//! - **Error Handling**: compile diagnostics and coded runtime errors

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod error;
pub mod span;
pub mod value;

pub use error::{CompileError, RuntimeError, RuntimeErrorCode, VesperError};
pub use span::Token;
pub use value::{Value, ValueKind};

/// Vesper runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
