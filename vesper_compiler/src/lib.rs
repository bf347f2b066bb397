//! # Vesper Compiler
//!
//! Lowers parsed module ASTs into a linear bytecode stream with a flat
//! constant pool. The parser is an external collaborator: it hands over a
//! topologically sorted list of [`ast::Module`]s with resolved top-level
//! declarations, exports, and imports.
//!
//! The compiler is single-pass over statements but two-pass per module:
//! every top-level declaration claims a slot in the globals array before any
//! statement is compiled, so top-level declarations can reference each other
//! forward while use-before-initialization is still caught.
//!
//! Compiled functions and classes are materialized at compile time: their
//! closure/class objects are stored directly into the globals array, so no
//! runtime bytecode exists to construct them.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod ast;
pub mod chunk;
pub mod compiler;
pub mod opcode;

pub use chunk::{Chunk, CodeBlock, LineRange};
pub use compiler::{Compiler, CompilerOutput, GlobalVar};
pub use opcode::OpCode;
