//! # Vesper Runtime
//!
//! The heap half of the engine:
//!
//! - **Object Model**: the closed set of heap object variants, each with a
//!   common header carrying the kind tag and GC mark bit
//! - **Garbage Collector**: allocation, the live-objects list, string
//!   interning, and stop-the-world mark-and-sweep
//! - **Native Registry**: the types through which the VM exposes native
//!   functions and per-builtin method tables
//!
//! All heap objects are owned by the collector's object list and addressed
//! by raw pointer. The VM's safepoint protocol guarantees no interpreter
//! thread is running while the collector mutates the heap.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod gc;
pub mod natives;
pub mod object;

pub use gc::{GcHeap, Tracer};
pub use natives::{Builtin, BuiltinMethod, NativeCtx, NativeFn, NativeRegistry};
pub use object::{
    ObjArray, ObjBoundMethod, ObjBoundNative, ObjClass, ObjClosure, ObjFile, ObjFunction,
    ObjFuture, ObjHeader, ObjInstance, ObjKind, ObjMutex, ObjNative, ObjString, ObjUpvalue,
};
