//! # Vesper VM
//!
//! The execution half of the engine: the virtual machine hosting the shared
//! code block and globals, one interpreter [`thread::Thread`] per OS thread
//! (the main thread plus one child per `async` call), the bytecode dispatch
//! loop, and the concrete native function set.
//!
//! The entry point is [`interpret`]: hand it the parsed modules, get back the
//! script's result value.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod natives;
pub mod thread;
pub mod vm;

pub use thread::Thread;
pub use vm::Vm;

use std::sync::Arc;
use vesper_compiler::ast::Module;
use vesper_compiler::Compiler;
use vesper_core::{Value, VesperError};
use vesper_runtime::GcHeap;

/// Compile a topologically sorted module list and run it to completion.
///
/// Returns the script's result: the value of a top-level `return`, or nil
/// when the script runs off its end.
pub fn interpret(modules: &[Module]) -> Result<Value, VesperError> {
    let heap = Arc::new(GcHeap::new());
    let registry = natives::create_registry(&heap);
    let output =
        Compiler::compile(modules, &heap, &registry).map_err(VesperError::Compile)?;
    let vm = Vm::new(heap, registry, output);
    vm.run().map_err(VesperError::Runtime)
}
